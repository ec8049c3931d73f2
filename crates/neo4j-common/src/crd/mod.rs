//! Custom Resource Definitions for the Neo4j operator

mod cluster;
mod types;

pub use cluster::{
    ChildNames, ClusterDiagnostics, DatabaseDiagnostic, EndpointStatus, Neo4jEnterpriseCluster,
    Neo4jEnterpriseClusterSpec, Neo4jEnterpriseClusterStatus, ReplicaStatus, ServerDiagnostic,
};
pub use types::{
    conditions, find_condition, set_condition, AuthSpec, ClusterPhase, Condition,
    ConditionStatus, ImageSpec, QueryMonitoringSpec, SecretRef, StorageSpec, TlsMode, TlsSpec,
    TopologySpec,
};
