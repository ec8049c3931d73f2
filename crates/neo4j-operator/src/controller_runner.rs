//! Controller runner - builds the Neo4jEnterpriseCluster controller future
//!
//! The kube-rs `Controller` is the work queue: triggers for the same object
//! are coalesced and at most one reconcile per object runs at a time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use neo4j_cluster::controller::{error_policy, reconcile, Context};
use neo4j_common::crd::Neo4jEnterpriseCluster;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Build the cluster controller future
///
/// Changes to owned StatefulSets, Services and ConfigMaps requeue their
/// owning cluster.
pub fn build_cluster_controller(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
    concurrency: u16,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let clusters: Api<Neo4jEnterpriseCluster> = scoped_api(&client, namespace);

    tracing::info!(
        namespace = namespace.unwrap_or("<all>"),
        concurrency,
        "- Neo4jEnterpriseCluster controller"
    );

    Box::pin(
        Controller::new(clusters, watcher())
            .owns(scoped_api::<StatefulSet>(&client, namespace), watcher())
            .owns(scoped_api::<Service>(&client, namespace), watcher())
            .owns(scoped_api::<ConfigMap>(&client, namespace), watcher())
            .with_config(ControllerConfig::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Neo4jEnterpriseCluster")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
