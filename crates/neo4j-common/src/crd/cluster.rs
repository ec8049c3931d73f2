//! Neo4jEnterpriseCluster Custom Resource Definition
//!
//! A Neo4jEnterpriseCluster declares the desired topology of a clustered
//! Neo4j Enterprise deployment. The status is owned by the operator and
//! carries the lifecycle phase, conditions and protocol-level diagnostics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    AuthSpec, ClusterPhase, Condition, ImageSpec, QueryMonitoringSpec, StorageSpec, TlsSpec,
    TopologySpec,
};

/// Specification for a Neo4jEnterpriseCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "neo4j.neo4j.com",
    version = "v1alpha1",
    kind = "Neo4jEnterpriseCluster",
    plural = "neo4jenterpriseclusters",
    shortname = "neo4jc",
    status = "Neo4jEnterpriseClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Primaries","type":"integer","jsonPath":".spec.topology.primaries"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.replicas.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct Neo4jEnterpriseClusterSpec {
    /// Database server image
    #[serde(default)]
    pub image: ImageSpec,

    /// Server count and default database allocation
    pub topology: TopologySpec,

    /// Data volume for each server
    #[serde(default)]
    pub storage: StorageSpec,

    /// Credentials for the operator and clients
    pub auth: AuthSpec,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsSpec,

    /// Query monitoring
    #[serde(default)]
    pub query_monitoring: QueryMonitoringSpec,

    /// Additional `neo4j.conf` settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

/// Replica counts as last converged by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    /// Primaries in the last applied topology
    #[serde(default)]
    pub primaries: i32,

    /// Secondaries in the last applied topology
    #[serde(default)]
    pub secondaries: i32,

    /// Ready server pods
    #[serde(default)]
    pub ready: i32,
}

/// Client-facing endpoints
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatus {
    /// Bolt endpoint (`neo4j://host:7687`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bolt: Option<String>,

    /// HTTP endpoint (`http://host:7474`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,

    /// Headless service used for per-member addressing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless: Option<String>,
}

/// One row of `SHOW SERVERS`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerDiagnostic {
    /// Server id
    pub name: String,
    /// Bolt address advertised by the server
    pub address: String,
    /// Server state (e.g., "Enabled", "Cordoned")
    pub state: String,
    /// Server health (e.g., "Available", "Unavailable")
    pub health: String,
    /// Number of databases hosted
    #[serde(default)]
    pub hosting_count: i32,
}

impl ServerDiagnostic {
    /// State value of a server that accepts allocations
    pub const STATE_ENABLED: &'static str = "Enabled";
    /// Health value of a server that is reachable
    pub const HEALTH_AVAILABLE: &'static str = "Available";

    /// True when the server is Enabled and Available
    pub fn is_healthy(&self) -> bool {
        self.state == Self::STATE_ENABLED && self.health == Self::HEALTH_AVAILABLE
    }
}

/// One row of `SHOW DATABASES`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDiagnostic {
    /// Database name
    pub name: String,
    /// Current status on the reporting server (e.g., "online")
    pub status: String,
    /// Requested status (e.g., "online", "offline")
    pub requested_status: String,
    /// Role on the reporting server (e.g., "primary")
    #[serde(default)]
    pub role: String,
    /// Whether this is the default database
    #[serde(default)]
    pub is_default: bool,
}

impl DatabaseDiagnostic {
    /// Name of the internal system database
    pub const SYSTEM: &'static str = "system";
    /// Online status value
    pub const ONLINE: &'static str = "online";

    /// True for the internal system database
    pub fn is_system(&self) -> bool {
        self.name == Self::SYSTEM
    }

    /// True when the database should be online but is not
    pub fn is_offline_unexpectedly(&self) -> bool {
        self.requested_status == Self::ONLINE && self.status != Self::ONLINE
    }
}

/// Snapshot of the database's own view of the cluster
///
/// Written as a whole on every collection attempt.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDiagnostics {
    /// Servers from `SHOW SERVERS`
    #[serde(default)]
    pub servers: Vec<ServerDiagnostic>,

    /// Databases from `SHOW DATABASES`
    #[serde(default)]
    pub databases: Vec<DatabaseDiagnostic>,

    /// When this snapshot was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_collected: Option<DateTime<Utc>>,

    /// Errors from this attempt; empty on success
    #[serde(default)]
    pub collection_error: String,
}

/// Status for a Neo4jEnterpriseCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Neo4jEnterpriseClusterStatus {
    /// Generation of the spec last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the cluster state, unique by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Replica counts
    #[serde(default)]
    pub replicas: ReplicaStatus,

    /// Client endpoints
    #[serde(default)]
    pub endpoints: EndpointStatus,

    /// Image the servers were last fully rolled out with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Protocol-level diagnostics, populated while Ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<ClusterDiagnostics>,
}

impl Neo4jEnterpriseClusterStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Add or update a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        super::types::set_condition(&mut self.conditions, condition);
        self
    }
}

impl Neo4jEnterpriseCluster {
    /// Current phase, defaulting to Pending when no status exists
    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Generation of the spec, 0 if the server has not assigned one
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// Namespace of the resource, "default" if unset
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Names of the objects this cluster owns
    pub fn child_names(&self) -> ChildNames {
        ChildNames::for_cluster(&self.name_any())
    }

    /// Name of the StatefulSet running the servers
    pub fn server_set_name(&self) -> String {
        self.child_names().server_set
    }

    /// Name of the headless Service giving each server a stable DNS name
    pub fn headless_service_name(&self) -> String {
        self.child_names().headless_service
    }

    /// Name of the client Service
    pub fn client_service_name(&self) -> String {
        self.child_names().client_service
    }

    /// Name of the ConfigMap holding `neo4j.conf` settings
    pub fn config_map_name(&self) -> String {
        self.child_names().config_map
    }
}

/// Names of the objects owned by one cluster
///
/// Derived from the cluster name alone, so they can be computed for a
/// cluster that has already been deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildNames {
    /// StatefulSet running the servers
    pub server_set: String,
    /// Headless Service giving each server a stable DNS name
    pub headless_service: String,
    /// Client Service
    pub client_service: String,
    /// ConfigMap holding `neo4j.conf` settings
    pub config_map: String,
}

impl ChildNames {
    /// Names for the cluster called `cluster`
    pub fn for_cluster(cluster: &str) -> Self {
        Self {
            server_set: format!("{cluster}-server"),
            headless_service: format!("{cluster}-headless"),
            client_service: cluster.to_string(),
            config_map: format!("{cluster}-config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{conditions, ConditionStatus, SecretRef};

    fn sample_spec() -> Neo4jEnterpriseClusterSpec {
        Neo4jEnterpriseClusterSpec {
            image: ImageSpec::default(),
            topology: TopologySpec {
                servers: 3,
                primaries: 3,
                secondaries: 0,
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
        }
    }

    #[test]
    fn test_spec_roundtrips_camel_case() {
        let yaml = r#"
topology:
  servers: 3
  primaries: 3
auth:
  secretRef:
    name: graph-auth
queryMonitoring:
  enabled: true
"#;
        let spec: Neo4jEnterpriseClusterSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.topology.primaries, 3);
        assert_eq!(spec.topology.secondaries, 0);
        assert!(spec.query_monitoring.enabled);
        assert_eq!(spec.image, ImageSpec::default());
    }

    #[test]
    fn test_child_object_names() {
        let cluster = Neo4jEnterpriseCluster::new("graph", sample_spec());
        assert_eq!(cluster.server_set_name(), "graph-server");
        assert_eq!(cluster.headless_service_name(), "graph-headless");
        assert_eq!(cluster.config_map_name(), "graph-config");
        assert_eq!(cluster.phase(), ClusterPhase::Pending);
    }

    #[test]
    fn test_server_and_database_health_rules() {
        let server = ServerDiagnostic {
            name: "s0".into(),
            address: "a:7687".into(),
            state: "Enabled".into(),
            health: "Available".into(),
            hosting_count: 2,
        };
        assert!(server.is_healthy());
        let cordoned = ServerDiagnostic {
            state: "Cordoned".into(),
            ..server
        };
        assert!(!cordoned.is_healthy());

        let stopped = DatabaseDiagnostic {
            name: "reports".into(),
            status: "offline".into(),
            requested_status: "offline".into(),
            ..Default::default()
        };
        assert!(!stopped.is_offline_unexpectedly());
    }

    #[test]
    fn test_status_condition_builder_keeps_types_unique() {
        let status = Neo4jEnterpriseClusterStatus::with_phase(ClusterPhase::Ready)
            .condition(Condition::new(
                conditions::READY,
                ConditionStatus::False,
                conditions::MEMBERS_NOT_READY,
                "1/3",
            ))
            .condition(Condition::new(
                conditions::READY,
                ConditionStatus::True,
                conditions::ALL_MEMBERS_READY,
                "3/3",
            ));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }
}
