//! Split-brain detection and minority repair
//!
//! Every expected member is queried on its own per-pod address, never through
//! the client Service, which could route every query into one partition.
//! Each member reports which members it sees as Enabled and Available; the
//! members are then grouped by identical view.
//!
//! The detector only draws a conclusion it can defend:
//! - fewer than a majority of expected members answered: `Unknown`
//! - one view shared by everyone who answered: `Healthy`
//! - one group's view is strictly larger than every other group's, covers a
//!   majority of the expected members, and is disjoint from every other
//!   view: `Partitioned`, the other groups are the minority
//! - anything else (ties, overlapping views): `Unknown`
//!
//! An even split is reported as `Unknown` rather than guessing which side is
//! legitimate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams};
use kube::Client;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use neo4j_common::crd::{
    conditions, Condition, ConditionStatus, Neo4jEnterpriseCluster, ServerDiagnostic,
};
use neo4j_common::Error;

use crate::credentials::Credentials;
use crate::protocol::{Connector, Endpoint};

/// One member's answer: the members it considers Enabled and Available
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberView {
    /// Member that answered
    pub member: String,
    /// Members it sees, itself included
    pub view: BTreeSet<String>,
}

/// Outcome of a detection cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SplitBrainVerdict {
    /// Every responding member agrees on membership
    Healthy {
        /// Members that answered
        members: Vec<String>,
    },
    /// A majority group and one or more disjoint minority groups
    Partitioned {
        /// Members of the majority group
        majority: Vec<String>,
        /// Members to restart
        minority: Vec<String>,
    },
    /// Not enough evidence to act
    Unknown {
        /// Why no verdict was reached
        reason: String,
    },
}

impl SplitBrainVerdict {
    /// `MembershipConsistent` condition for this verdict
    pub fn condition(&self, generation: i64) -> Condition {
        let (status, reason, message) = match self {
            Self::Healthy { members } => (
                ConditionStatus::True,
                conditions::MEMBERSHIP_AGREED,
                format!("{} members agree on membership", members.len()),
            ),
            Self::Partitioned { majority, minority } => (
                ConditionStatus::False,
                conditions::PARTITION_DETECTED,
                format!(
                    "members {} are partitioned from majority {}",
                    minority.join(", "),
                    majority.join(", ")
                ),
            ),
            Self::Unknown { reason } => (
                ConditionStatus::Unknown,
                conditions::MEMBERSHIP_UNKNOWN,
                reason.clone(),
            ),
        };
        Condition::new(conditions::MEMBERSHIP_CONSISTENT, status, reason, message)
            .generation(generation)
    }
}

/// Names of the members a cluster should have
pub fn expected_members(cluster: &Neo4jEnterpriseCluster) -> Vec<String> {
    (0..cluster.spec.topology.effective_servers())
        .map(|i| format!("{}-{}", cluster.server_set_name(), i))
        .collect()
}

/// Member name behind a `SHOW SERVERS` address, if it is an expected member
fn member_of(address: &str, expected: &BTreeSet<String>) -> Option<String> {
    let host = address.split(':').next()?;
    let pod = host.split('.').next()?;
    expected.contains(pod).then(|| pod.to_string())
}

/// Build a member's view from the servers it reported
pub fn view_from_servers(
    member: &str,
    servers: &[ServerDiagnostic],
    expected: &BTreeSet<String>,
) -> MemberView {
    let mut view: BTreeSet<String> = servers
        .iter()
        .filter(|s| s.is_healthy())
        .filter_map(|s| member_of(&s.address, expected))
        .collect();
    view.insert(member.to_string());
    MemberView {
        member: member.to_string(),
        view,
    }
}

/// Group views and decide
pub fn evaluate(expected: &[String], views: &[MemberView]) -> SplitBrainVerdict {
    let quorum = expected.len() / 2 + 1;
    if views.len() < quorum {
        return SplitBrainVerdict::Unknown {
            reason: format!(
                "only {} of {} members answered, need {quorum}",
                views.len(),
                expected.len()
            ),
        };
    }

    let mut groups: BTreeMap<&BTreeSet<String>, Vec<String>> = BTreeMap::new();
    for v in views {
        groups.entry(&v.view).or_default().push(v.member.clone());
    }
    if groups.len() == 1 {
        return SplitBrainVerdict::Healthy {
            members: views.iter().map(|v| v.member.clone()).collect(),
        };
    }

    let mut ranked: Vec<_> = groups.into_iter().collect();
    ranked.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    let (majority_view, majority) = &ranked[0];
    if ranked[1].0.len() == majority_view.len() {
        return SplitBrainVerdict::Unknown {
            reason: format!(
                "no membership view is strictly larger than the others ({} members each)",
                majority_view.len()
            ),
        };
    }
    if majority_view.len() < quorum {
        return SplitBrainVerdict::Unknown {
            reason: format!(
                "largest agreeing group sees {} of {} members, not a majority",
                majority_view.len(),
                expected.len()
            ),
        };
    }

    let mut minority = Vec::new();
    for (view, members) in &ranked[1..] {
        if !view.is_disjoint(majority_view) {
            return SplitBrainVerdict::Unknown {
                reason: "membership views overlap, cluster is still converging".to_string(),
            };
        }
        minority.extend(members.iter().cloned());
    }
    minority.sort();

    SplitBrainVerdict::Partitioned {
        majority: majority.clone(),
        minority,
    }
}

/// Queries members and evaluates their views
pub struct SplitBrainDetector {
    connector: Arc<dyn Connector>,
    query_timeout: Duration,
}

impl SplitBrainDetector {
    /// Create a detector; each member query is bounded by `query_timeout`
    pub fn new(connector: Arc<dyn Connector>, query_timeout: Duration) -> Self {
        Self {
            connector,
            query_timeout,
        }
    }

    /// Ask every expected member for its view, concurrently
    ///
    /// Members that cannot be reached are left out.
    pub async fn collect_views(
        &self,
        cluster: &Neo4jEnterpriseCluster,
        credentials: &Credentials,
    ) -> Vec<MemberView> {
        let expected = expected_members(cluster);
        let expected_set: BTreeSet<String> = expected.iter().cloned().collect();

        let queries = expected.iter().map(|member| {
            let endpoint = Endpoint::for_member(cluster, member);
            let expected_set = &expected_set;
            async move {
                let attempt = async {
                    let session = self.connector.connect(&endpoint, credentials).await?;
                    let servers = session.list_servers().await;
                    session.close().await;
                    servers
                };
                match tokio::time::timeout(self.query_timeout, attempt).await {
                    Ok(Ok(servers)) => Some(view_from_servers(member, &servers, expected_set)),
                    Ok(Err(e)) => {
                        debug!(member = %member, error = %e, "member query failed");
                        None
                    }
                    Err(_) => {
                        debug!(member = %member, "member query timed out");
                        None
                    }
                }
            }
        });

        join_all(queries).await.into_iter().flatten().collect()
    }

    /// Collect views and evaluate
    pub async fn detect(
        &self,
        cluster: &Neo4jEnterpriseCluster,
        credentials: &Credentials,
    ) -> SplitBrainVerdict {
        let views = self.collect_views(cluster, credentials).await;
        evaluate(&expected_members(cluster), &views)
    }
}

/// Restarts a member so the platform reschedules it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MemberRestarter: Send + Sync {
    /// Restart one member
    async fn restart_member(&self, namespace: &str, member: &str) -> Result<(), Error>;
}

/// Restarts members by deleting their pod
pub struct PodRestarter {
    client: Client,
}

impl PodRestarter {
    /// Create a restarter using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MemberRestarter for PodRestarter {
    async fn restart_member(&self, namespace: &str, member: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(member, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Result of restarting a minority
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Members restarted
    pub restarted: Vec<String>,
    /// Members that could not be restarted, with the error
    pub failed: Vec<(String, String)>,
}

/// Restart every minority member; majority members are never touched
///
/// Failures are collected, not returned: the next detection cycle retries.
pub async fn repair(
    restarter: &dyn MemberRestarter,
    namespace: &str,
    minority: &[String],
) -> RepairOutcome {
    let mut outcome = RepairOutcome::default();
    for member in minority {
        match restarter.restart_member(namespace, member).await {
            Ok(()) => outcome.restarted.push(member.clone()),
            Err(e) => {
                warn!(member = %member, error = %e, "failed to restart partitioned member");
                outcome.failed.push((member.clone(), e.to_string()));
            }
        }
    }
    outcome
}
