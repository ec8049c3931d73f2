//! Conflict-retry status updater
//!
//! The only writer of `Neo4jEnterpriseCluster` status. Every attempt reads
//! the latest object, applies the caller's mutation to a copy of its status
//! and writes it back carrying the `resourceVersion` it read. A concurrent
//! writer makes the API server reject the write with 409; the updater then
//! re-reads and re-applies the mutation from scratch.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use neo4j_common::crd::{Neo4jEnterpriseCluster, Neo4jEnterpriseClusterStatus};
use neo4j_common::kube_utils::FIELD_MANAGER;
use neo4j_common::retry::{retry_with_backoff_if, RetryConfig, RetryError};
use neo4j_common::Error;

/// Default number of read-modify-write attempts
pub const DEFAULT_STATUS_ATTEMPTS: u32 = 5;

/// Versioned access to cluster resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Read the latest version of a cluster
    async fn get_cluster(&self, namespace: &str, name: &str)
        -> Result<Neo4jEnterpriseCluster, Error>;

    /// Write a cluster's status if its resource version is still
    /// `resource_version`; a conflict error otherwise
    async fn write_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &Neo4jEnterpriseClusterStatus,
    ) -> Result<(), Error>;
}

/// [`StatusStore`] backed by the Kubernetes API
pub struct KubeStatusStore {
    client: Client,
}

impl KubeStatusStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Neo4jEnterpriseCluster, Error> {
        let api: Api<Neo4jEnterpriseCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn write_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &Neo4jEnterpriseClusterStatus,
    ) -> Result<(), Error> {
        let api: Api<Neo4jEnterpriseCluster> = Api::namespaced(self.client.clone(), namespace);

        // resourceVersion in a merge patch makes the write conditional
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Applies status mutations under optimistic concurrency
#[derive(Clone)]
pub struct StatusUpdater {
    store: Arc<dyn StatusStore>,
    retry: RetryConfig,
}

impl StatusUpdater {
    /// Create an updater with the given retry policy
    pub fn new(store: Arc<dyn StatusStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Default retry policy for status writes
    pub fn default_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: DEFAULT_STATUS_ATTEMPTS,
            initial_delay: std::time::Duration::from_millis(50),
            max_delay: std::time::Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }

    /// Read-modify-write a cluster's status
    ///
    /// `mutate` may run several times, each time on a fresh copy of the
    /// latest status, so it must derive everything from its argument and
    /// captured values. Returns the status as written.
    ///
    /// Only conflicts are retried. Running out of attempts yields
    /// [`Error::RetryExhausted`], which is retryable: the caller should
    /// requeue rather than fail.
    pub async fn update_status<F>(
        &self,
        namespace: &str,
        name: &str,
        mutate: F,
    ) -> Result<Neo4jEnterpriseClusterStatus, Error>
    where
        F: Fn(&mut Neo4jEnterpriseClusterStatus) + Send + Sync,
    {
        let operation = format!("update_status {namespace}/{name}");
        let store = &self.store;
        let mutate = &mutate;
        let result = retry_with_backoff_if(
            &self.retry,
            &operation,
            Error::is_conflict,
            move || async move {
                let latest = store.get_cluster(namespace, name).await?;
                let resource_version =
                    latest.metadata.resource_version.clone().ok_or_else(|| {
                        Error::internal_with_context(
                            "status-update",
                            format!("{namespace}/{name} has no resourceVersion"),
                        )
                    })?;

                let mut status = latest.status.clone().unwrap_or_default();
                mutate(&mut status);
                if latest.status.as_ref() == Some(&status) {
                    debug!(cluster = %name, "status unchanged, skipping write");
                    return Ok::<_, Error>(status);
                }

                store
                    .write_status(namespace, name, &resource_version, &status)
                    .await?;
                Ok(status)
            },
        )
        .await;

        result.map_err(|e| match e {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { attempts, last } => {
                Error::retry_exhausted(operation, attempts, last.to_string())
            }
        })
    }
}
