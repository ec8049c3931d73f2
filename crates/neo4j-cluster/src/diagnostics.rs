//! Protocol-level diagnostics
//!
//! Collects the database's own view of the cluster (`SHOW SERVERS`,
//! `SHOW DATABASES`) and turns it into the `ServersHealthy` and
//! `DatabasesHealthy` conditions. Collection never fails: errors are
//! recorded in the snapshot and the conditions go Unknown, so a database
//! that cannot be queried never blocks reconciliation.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, warn};

use neo4j_common::crd::{
    conditions, set_condition, ClusterDiagnostics, Condition, ConditionStatus,
    DatabaseDiagnostic, Neo4jEnterpriseCluster, Neo4jEnterpriseClusterStatus,
};
use neo4j_common::error::ProtocolErrorKind;
use neo4j_common::metrics::{MetricsRegistry, ServerSeries};
use neo4j_common::Error;

use crate::protocol::{cluster_key, ProtocolClient};
use crate::status::StatusUpdater;

/// Collects diagnostics and publishes them to status and metrics
#[derive(Clone)]
pub struct DiagnosticsCollector {
    query_timeout: Duration,
    metrics: MetricsRegistry,
}

impl DiagnosticsCollector {
    /// Create a collector; each query is bounded by `query_timeout`
    pub fn new(query_timeout: Duration, metrics: MetricsRegistry) -> Self {
        Self {
            query_timeout,
            metrics,
        }
    }

    /// Run both diagnostic queries on an open session
    pub async fn collect(
        &self,
        cluster: &Neo4jEnterpriseCluster,
        session: &dyn ProtocolClient,
    ) -> ClusterDiagnostics {
        let key = cluster_key(cluster);
        let mut errors = Vec::new();

        let servers = match self.bounded(&key, "SHOW SERVERS", session.list_servers()).await {
            Ok(servers) => servers,
            Err(e) => {
                errors.push(format!("servers: {e}"));
                Vec::new()
            }
        };
        let databases = match self
            .bounded(&key, "SHOW DATABASES", session.list_databases())
            .await
        {
            Ok(databases) => databases,
            Err(e) => {
                errors.push(format!("databases: {e}"));
                Vec::new()
            }
        };

        if !errors.is_empty() {
            warn!(cluster = %key, errors = %errors.join("; "), "diagnostics collection incomplete");
        }
        ClusterDiagnostics {
            servers,
            databases,
            last_collected: Some(Utc::now()),
            collection_error: errors.join("; "),
        }
    }

    async fn bounded<T>(
        &self,
        cluster: &str,
        what: &str,
        query: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.query_timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(Error::protocol(
                cluster,
                ProtocolErrorKind::Timeout,
                format!("{what} timed out after {}s", self.query_timeout.as_secs()),
            )),
        }
    }

    /// Record a snapshot in status and metrics
    ///
    /// The snapshot and both conditions are written in one status update.
    pub async fn publish(
        &self,
        cluster: &Neo4jEnterpriseCluster,
        diagnostics: ClusterDiagnostics,
        status: &StatusUpdater,
    ) -> Result<ClusterDiagnostics, Error> {
        self.record_metrics(cluster, &diagnostics);

        let generation = cluster.generation();
        let snapshot = &diagnostics;
        status
            .update_status(&cluster.namespace_or_default(), &cluster.name_any(), |s| {
                apply_diagnostics(s, snapshot, generation)
            })
            .await?;
        debug!(
            cluster = %cluster.name_any(),
            servers = diagnostics.servers.len(),
            databases = diagnostics.databases.len(),
            "diagnostics published"
        );
        Ok(diagnostics)
    }

    /// Collect on `session` and publish
    pub async fn refresh(
        &self,
        cluster: &Neo4jEnterpriseCluster,
        session: &dyn ProtocolClient,
        status: &StatusUpdater,
    ) -> Result<ClusterDiagnostics, Error> {
        let diagnostics = self.collect(cluster, session).await;
        self.publish(cluster, diagnostics, status).await
    }

    /// Publish a snapshot for a cluster that could not be reached at all
    pub async fn publish_unavailable(
        &self,
        cluster: &Neo4jEnterpriseCluster,
        error: &Error,
        status: &StatusUpdater,
    ) -> Result<ClusterDiagnostics, Error> {
        self.publish(cluster, unavailable(error), status).await
    }

    fn record_metrics(&self, cluster: &Neo4jEnterpriseCluster, diagnostics: &ClusterDiagnostics) {
        let namespace = cluster.namespace_or_default();
        let name = cluster.name_any();
        let current: Vec<ServerSeries> = diagnostics
            .servers
            .iter()
            .map(|server| {
                let series = ServerSeries {
                    cluster: name.clone(),
                    namespace: namespace.clone(),
                    server_name: server.name.clone(),
                    server_address: server.address.clone(),
                };
                self.metrics
                    .record_server_health(series.clone(), server.is_healthy());
                series
            })
            .collect();

        // An empty list from a failed collection says nothing about which
        // servers exist
        if !current.is_empty() || diagnostics.collection_error.is_empty() {
            let removed = self.metrics.retain_servers(&namespace, &name, &current);
            if removed > 0 {
                debug!(removed, "dropped health series of departed servers");
            }
        }
    }
}

/// Snapshot for a failed connection
pub fn unavailable(error: &Error) -> ClusterDiagnostics {
    ClusterDiagnostics {
        last_collected: Some(Utc::now()),
        collection_error: error.to_string(),
        ..Default::default()
    }
}

/// Store a snapshot and its derived conditions in a status
pub fn apply_diagnostics(
    status: &mut Neo4jEnterpriseClusterStatus,
    diagnostics: &ClusterDiagnostics,
    generation: i64,
) {
    status.diagnostics = Some(diagnostics.clone());
    set_condition(&mut status.conditions, servers_condition(diagnostics, generation));
    set_condition(&mut status.conditions, databases_condition(diagnostics, generation));
}

fn unavailable_condition(
    type_: &str,
    diagnostics: &ClusterDiagnostics,
    fallback: &str,
) -> Condition {
    let message = if diagnostics.collection_error.is_empty() {
        fallback.to_string()
    } else {
        diagnostics.collection_error.clone()
    };
    Condition::new(
        type_,
        ConditionStatus::Unknown,
        conditions::DIAGNOSTICS_UNAVAILABLE,
        message,
    )
}

/// `ServersHealthy` from a snapshot
pub fn servers_condition(diagnostics: &ClusterDiagnostics, generation: i64) -> Condition {
    let servers = &diagnostics.servers;
    if servers.is_empty() {
        return unavailable_condition(
            conditions::SERVERS_HEALTHY,
            diagnostics,
            "no servers reported",
        )
        .generation(generation);
    }

    let offenders: Vec<String> = servers
        .iter()
        .filter(|s| !s.is_healthy())
        .map(|s| format!("{} (state={}, health={})", s.name, s.state, s.health))
        .collect();

    let condition = if offenders.is_empty() {
        Condition::new(
            conditions::SERVERS_HEALTHY,
            ConditionStatus::True,
            conditions::ALL_SERVERS_HEALTHY,
            format!("All {} servers are Enabled and Available", servers.len()),
        )
    } else {
        Condition::new(
            conditions::SERVERS_HEALTHY,
            ConditionStatus::False,
            conditions::SERVER_DEGRADED,
            format!(
                "{} of {} servers unhealthy: {}",
                offenders.len(),
                servers.len(),
                offenders.join(", ")
            ),
        )
    };
    condition.generation(generation)
}

/// `DatabasesHealthy` from a snapshot; the system database is ignored
pub fn databases_condition(diagnostics: &ClusterDiagnostics, generation: i64) -> Condition {
    let user: Vec<&DatabaseDiagnostic> = diagnostics
        .databases
        .iter()
        .filter(|d| !d.is_system())
        .collect();
    if user.is_empty() {
        return unavailable_condition(
            conditions::DATABASES_HEALTHY,
            diagnostics,
            "no user databases reported",
        )
        .generation(generation);
    }

    // One row per database per hosting server
    let names: BTreeSet<&str> = user.iter().map(|d| d.name.as_str()).collect();
    let mut seen = BTreeSet::new();
    let offenders: Vec<String> = user
        .iter()
        .filter(|d| d.is_offline_unexpectedly())
        .filter(|d| seen.insert(d.name.as_str()))
        .map(|d| format!("{} (status={}, requested={})", d.name, d.status, d.requested_status))
        .collect();

    let condition = if offenders.is_empty() {
        Condition::new(
            conditions::DATABASES_HEALTHY,
            ConditionStatus::True,
            conditions::ALL_DATABASES_ONLINE,
            format!("All {} databases are online", names.len()),
        )
    } else {
        Condition::new(
            conditions::DATABASES_HEALTHY,
            ConditionStatus::False,
            conditions::DATABASE_OFFLINE,
            format!("Databases not online: {}", offenders.join(", ")),
        )
    };
    condition.generation(generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MockProtocolClient, Rows};
    use crate::status::MockStatusStore;
    use crate::testing::{cluster, database, server};
    use async_trait::async_trait;
    use neo4j_common::crd::find_condition;
    use std::sync::Arc;

    fn collector() -> DiagnosticsCollector {
        DiagnosticsCollector::new(Duration::from_secs(10), MetricsRegistry::new())
    }

    fn snapshot(
        servers: Vec<neo4j_common::crd::ServerDiagnostic>,
        databases: Vec<DatabaseDiagnostic>,
    ) -> ClusterDiagnostics {
        ClusterDiagnostics {
            servers,
            databases,
            last_collected: Some(Utc::now()),
            collection_error: String::new(),
        }
    }

    #[test]
    fn healthy_servers_report_true() {
        let diag = snapshot(
            vec![
                server("s0", "Enabled", "Available"),
                server("s1", "Enabled", "Available"),
                server("s2", "Enabled", "Available"),
            ],
            vec![],
        );
        let c = servers_condition(&diag, 2);
        assert_eq!(c.status, ConditionStatus::True);
        assert_eq!(c.reason, conditions::ALL_SERVERS_HEALTHY);
        assert_eq!(c.message, "All 3 servers are Enabled and Available");
        assert_eq!(c.observed_generation, 2);
    }

    #[test]
    fn unhealthy_server_is_named_with_state_and_health() {
        let diag = snapshot(
            vec![
                server("s0", "Enabled", "Available"),
                server("s1", "Cordoned", "Available"),
                server("s2", "Enabled", "Unavailable"),
            ],
            vec![],
        );
        let c = servers_condition(&diag, 1);
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.reason, conditions::SERVER_DEGRADED);
        assert!(c.message.contains("s1 (state=Cordoned, health=Available)"));
        assert!(c.message.contains("s2 (state=Enabled, health=Unavailable)"));
        assert!(!c.message.contains("s0"));
    }

    #[test]
    fn system_database_is_ignored() {
        let diag = snapshot(
            vec![],
            vec![
                database("system", "offline", "online"),
                database("neo4j", "online", "online"),
                database("neo4j", "online", "online"),
            ],
        );
        let c = databases_condition(&diag, 1);
        assert_eq!(c.status, ConditionStatus::True);
        assert_eq!(c.message, "All 1 databases are online");
    }

    #[test]
    fn offline_database_is_reported_once() {
        let diag = snapshot(
            vec![],
            vec![
                database("neo4j", "online", "online"),
                database("reports", "offline", "online"),
                database("reports", "offline", "online"),
                database("archive", "offline", "offline"),
            ],
        );
        let c = databases_condition(&diag, 1);
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.reason, conditions::DATABASE_OFFLINE);
        assert_eq!(c.message.matches("reports").count(), 1);
        assert!(!c.message.contains("archive"));
    }

    #[test]
    fn empty_snapshot_is_unknown() {
        let diag = unavailable(&Error::protocol(
            "db/graph",
            ProtocolErrorKind::Connection,
            "refused",
        ));
        let servers = servers_condition(&diag, 1);
        let databases = databases_condition(&diag, 1);
        assert_eq!(servers.status, ConditionStatus::Unknown);
        assert_eq!(servers.reason, conditions::DIAGNOSTICS_UNAVAILABLE);
        assert!(servers.message.contains("refused"));
        assert_eq!(databases.status, ConditionStatus::Unknown);

        // Only the system database is as good as none
        let only_system = snapshot(vec![], vec![database("system", "online", "online")]);
        assert_eq!(
            databases_condition(&only_system, 1).reason,
            conditions::DIAGNOSTICS_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn collect_keeps_partial_results() {
        let mut session = MockProtocolClient::new();
        session
            .expect_list_servers()
            .returning(|| Ok(vec![server("s0", "Enabled", "Available")]));
        session.expect_list_databases().returning(|| {
            Err(Error::protocol(
                "db/graph",
                ProtocolErrorKind::Query,
                "Neo.ClientError.Security.Forbidden",
            ))
        });

        let diag = collector().collect(&cluster(1, 0), &session).await;
        assert_eq!(diag.servers.len(), 1);
        assert!(diag.databases.is_empty());
        assert!(diag.collection_error.starts_with("databases:"));
        assert!(diag.last_collected.is_some());
    }

    /// Session whose queries never finish in time
    struct Stalled;

    #[async_trait]
    impl ProtocolClient for Stalled {
        async fn query(&self, _: &str) -> Result<Rows, Error> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Rows::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn each_query_is_bounded_by_the_timeout() {
        let diag = collector().collect(&cluster(3, 0), &Stalled).await;
        assert!(diag.servers.is_empty());
        assert!(diag.collection_error.contains("SHOW SERVERS timed out"));
        assert!(diag.collection_error.contains("SHOW DATABASES timed out"));
    }

    #[tokio::test]
    async fn publish_writes_snapshot_conditions_and_metrics() {
        let mut store = MockStatusStore::new();
        store.expect_get_cluster().returning(|_, _| Ok(cluster(3, 0)));
        store
            .expect_write_status()
            .withf(|ns, name, _, status| {
                ns == "db"
                    && name == "graph"
                    && status.diagnostics.as_ref().map(|d| d.servers.len()) == Some(2)
                    && find_condition(&status.conditions, conditions::SERVERS_HEALTHY)
                        .map(|c| c.status == ConditionStatus::False)
                        .unwrap_or(false)
                    && find_condition(&status.conditions, conditions::DATABASES_HEALTHY).is_some()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let updater = StatusUpdater::new(Arc::new(store), StatusUpdater::default_retry());

        let collector = collector();
        let diag = snapshot(
            vec![
                server("s0", "Enabled", "Available"),
                server("s1", "Enabled", "Unavailable"),
            ],
            vec![database("neo4j", "online", "online")],
        );
        collector
            .publish(&cluster(3, 0), diag, &updater)
            .await
            .unwrap();

        let samples = collector.metrics.server_health_for_cluster("db", "graph");
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().any(|(s, v)| s.server_name == "s0" && *v == 1.0));
        assert!(samples.iter().any(|(s, v)| s.server_name == "s1" && *v == 0.0));
    }

    #[tokio::test]
    async fn departed_servers_leave_the_health_series() {
        let mut store = MockStatusStore::new();
        store.expect_get_cluster().returning(|_, _| Ok(cluster(3, 0)));
        store.expect_write_status().returning(|_, _, _, _| Ok(()));
        let updater = StatusUpdater::new(Arc::new(store), StatusUpdater::default_retry());
        let collector = collector();
        let databases = || vec![database("neo4j", "online", "online")];

        let first = snapshot(
            vec![
                server("s0", "Enabled", "Available"),
                server("s1", "Enabled", "Available"),
            ],
            databases(),
        );
        collector.publish(&cluster(3, 0), first, &updater).await.unwrap();

        // s1 was replaced by s2
        let second = snapshot(
            vec![
                server("s0", "Enabled", "Available"),
                server("s2", "Enabled", "Available"),
            ],
            databases(),
        );
        collector.publish(&cluster(3, 0), second, &updater).await.unwrap();

        let names = |c: &DiagnosticsCollector| -> Vec<String> {
            c.metrics
                .server_health_for_cluster("db", "graph")
                .into_iter()
                .map(|(s, _)| s.server_name)
                .collect()
        };
        assert_eq!(names(&collector), ["s0", "s2"]);

        // A failed collection keeps the last known series
        let failed = unavailable(&Error::protocol(
            "db/graph",
            ProtocolErrorKind::Connection,
            "refused",
        ));
        collector.publish(&cluster(3, 0), failed, &updater).await.unwrap();
        assert_eq!(names(&collector), ["s0", "s2"]);
    }
}
