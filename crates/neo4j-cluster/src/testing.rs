//! Shared test fixtures

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use neo4j_common::crd::{
    AuthSpec, DatabaseDiagnostic, ImageSpec, Neo4jEnterpriseCluster, Neo4jEnterpriseClusterSpec,
    Neo4jEnterpriseClusterStatus, QueryMonitoringSpec, SecretRef, ServerDiagnostic, StorageSpec,
    TlsSpec, TopologySpec,
};
use neo4j_common::Error;

use crate::credentials::Credentials;
use crate::protocol::{Connector, Endpoint, ProtocolClient, Rows};
use crate::status::StatusStore;

/// Cluster `db/graph` at generation 1 with `primaries + secondaries` servers
pub(crate) fn cluster(primaries: i32, secondaries: i32) -> Neo4jEnterpriseCluster {
    let mut c = Neo4jEnterpriseCluster::new(
        "graph",
        Neo4jEnterpriseClusterSpec {
            image: ImageSpec::default(),
            topology: TopologySpec {
                servers: primaries + secondaries,
                primaries,
                secondaries,
            },
            storage: StorageSpec::default(),
            auth: AuthSpec {
                secret_ref: SecretRef {
                    name: "graph-auth".to_string(),
                },
            },
            tls: TlsSpec::default(),
            query_monitoring: QueryMonitoringSpec::default(),
            config: BTreeMap::new(),
        },
    );
    c.metadata.namespace = Some("db".to_string());
    c.metadata.uid = Some("uid-graph".to_string());
    c.metadata.generation = Some(1);
    c.metadata.resource_version = Some("1".to_string());
    c
}

/// `SHOW SERVERS` row
pub(crate) fn server(name: &str, state: &str, health: &str) -> ServerDiagnostic {
    ServerDiagnostic {
        name: name.to_string(),
        address: format!("{name}:7687"),
        state: state.to_string(),
        health: health.to_string(),
        hosting_count: 1,
    }
}

/// `SHOW DATABASES` row
pub(crate) fn database(name: &str, status: &str, requested: &str) -> DatabaseDiagnostic {
    DatabaseDiagnostic {
        name: name.to_string(),
        status: status.to_string(),
        requested_status: requested.to_string(),
        role: "primary".to_string(),
        is_default: name == "neo4j",
    }
}

/// Status store with API-server resourceVersion semantics
pub(crate) struct MemoryStatusStore {
    state: Mutex<(u64, Neo4jEnterpriseCluster)>,
}

impl MemoryStatusStore {
    pub(crate) fn new(cluster: Neo4jEnterpriseCluster) -> Self {
        Self {
            state: Mutex::new((1, cluster)),
        }
    }

    /// Latest stored object, with its resource version
    pub(crate) fn cluster(&self) -> Neo4jEnterpriseCluster {
        let state = self.state.lock();
        let mut c = state.1.clone();
        c.metadata.resource_version = Some(state.0.to_string());
        c
    }

    /// Simulate a user edit: new spec and metadata, status kept
    pub(crate) fn replace_spec(&self, cluster: Neo4jEnterpriseCluster) {
        let mut state = self.state.lock();
        let status = state.1.status.take();
        state.1 = cluster;
        state.1.status = status;
        state.0 += 1;
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get_cluster(&self, _: &str, _: &str) -> Result<Neo4jEnterpriseCluster, Error> {
        Ok(self.cluster())
    }

    async fn write_status(
        &self,
        _: &str,
        _: &str,
        resource_version: &str,
        status: &Neo4jEnterpriseClusterStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.0.to_string() != resource_version {
            return Err(Error::conflict("db/graph", "resourceVersion changed"));
        }
        state.0 += 1;
        state.1.status = Some(status.clone());
        Ok(())
    }
}

/// Connector whose sessions report a fixed server list
///
/// An isolated member's own session reports only itself; every other
/// session reports the isolated member as Unavailable.
pub(crate) struct StaticConnector {
    servers: Vec<ServerDiagnostic>,
    isolated: Mutex<Option<String>>,
    connects: AtomicUsize,
}

impl StaticConnector {
    pub(crate) fn new(servers: Vec<ServerDiagnostic>) -> Self {
        Self {
            servers,
            isolated: Mutex::new(None),
            connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn isolate(&self, member: &str) {
        *self.isolated.lock() = Some(member.to_string());
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _: &Credentials,
    ) -> Result<Arc<dyn ProtocolClient>, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let isolated = self.isolated.lock().clone();
        let on_member =
            |s: &ServerDiagnostic, member: &str| s.address.starts_with(&format!("{member}."));

        let servers = match (&isolated, &endpoint.member) {
            (Some(isolated), Some(member)) if isolated == member => self
                .servers
                .iter()
                .filter(|s| on_member(s, isolated.as_str()))
                .cloned()
                .collect(),
            (Some(isolated), Some(_)) => self
                .servers
                .iter()
                .cloned()
                .map(|mut s| {
                    if on_member(&s, isolated.as_str()) {
                        s.health = "Unavailable".to_string();
                    }
                    s
                })
                .collect(),
            _ => self.servers.clone(),
        };
        Ok(Arc::new(StaticSession {
            servers,
            databases: vec![database("neo4j", "online", "online")],
        }))
    }
}

struct StaticSession {
    servers: Vec<ServerDiagnostic>,
    databases: Vec<DatabaseDiagnostic>,
}

#[async_trait]
impl ProtocolClient for StaticSession {
    async fn query(&self, _: &str) -> Result<Rows, Error> {
        Ok(Rows::default())
    }

    async fn list_servers(&self) -> Result<Vec<ServerDiagnostic>, Error> {
        Ok(self.servers.clone())
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseDiagnostic>, Error> {
        Ok(self.databases.clone())
    }
}
