//! Supporting types for the Neo4jEnterpriseCluster CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Container image for the database servers
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Image repository (e.g., "neo4j")
    pub repo: String,

    /// Image tag (e.g., "5.26-enterprise")
    pub tag: String,

    /// Kubernetes image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
}

impl ImageSpec {
    /// Full image reference (`repo:tag`)
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repo, self.tag)
    }
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            repo: "neo4j".to_string(),
            tag: "5.26-enterprise".to_string(),
            pull_policy: None,
        }
    }
}

/// Server and database topology
///
/// `servers` is the number of database servers (pods). `primaries` and
/// `secondaries` are the default database allocation across those servers.
/// Signed so that negative user input reaches validation instead of failing
/// deserialization with an opaque message.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpec {
    /// Number of servers; 0 means `primaries + secondaries`
    #[serde(default)]
    pub servers: i32,

    /// Primary allocations for the default database
    pub primaries: i32,

    /// Secondary allocations for the default database
    #[serde(default)]
    pub secondaries: i32,
}

impl TopologySpec {
    /// Number of servers to run
    pub fn effective_servers(&self) -> i32 {
        if self.servers > 0 {
            self.servers
        } else {
            self.primaries.saturating_add(self.secondaries)
        }
    }

    /// True when the cluster runs a single primary
    pub fn is_single_primary(&self) -> bool {
        self.primaries == 1
    }
}

/// Persistent storage for each server
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class for the data volume claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Requested size (e.g., "10Gi")
    pub size: String,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            class_name: None,
            size: "10Gi".to_string(),
        }
    }
}

/// Reference to a Secret in the cluster's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,
}

/// Authentication configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    /// Secret holding `username`/`password` (or `NEO4J_AUTH` as `user/password`)
    pub secret_ref: SecretRef,
}

/// How intra-cluster and client traffic is secured
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain-text bolt, http and cluster traffic
    #[default]
    Disabled,
    /// A certificate from `secretRef` secures bolt and intra-cluster traffic
    ClusterCertificate,
}

/// TLS configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// TLS mode
    #[serde(default)]
    pub mode: TlsMode,

    /// Secret containing `tls.crt`/`tls.key` when mode is ClusterCertificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

/// Query monitoring (query log and metrics)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryMonitoringSpec {
    /// Enable query logging
    #[serde(default)]
    pub enabled: bool,
}

/// Cluster lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// No member is ready yet
    #[default]
    Pending,
    /// Members are starting and joining the cluster
    Forming,
    /// All members are ready
    Ready,
    /// The cluster was Ready and has lost members or health
    Degraded,
    /// The spec is invalid; waiting for the user to fix it
    Failed,
    /// A new image is being rolled out
    Upgrading,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Forming => write!(f, "Forming"),
            Self::Ready => write!(f, "Ready"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Failed => write!(f, "Failed"),
            Self::Upgrading => write!(f, "Upgrading"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., ServersHealthy)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Generation of the spec this condition was computed from
    #[serde(default)]
    pub observed_generation: i64,

    /// Last time `status` or `reason` changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: 0,
            last_transition_time: Utc::now(),
        }
    }

    /// Set the observed generation and return self for chaining
    pub fn generation(mut self, generation: i64) -> Self {
        self.observed_generation = generation;
        self
    }

    /// True when this condition carries the same status and reason as `other`
    pub fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason
    }
}

/// Insert or update a condition in place.
///
/// At most one condition per type is kept. When the existing entry has the
/// same status and reason only the message and observed generation change
/// and `lastTransitionTime` is preserved; otherwise the entry is replaced
/// with the new transition time.
///
/// Returns true if anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.same_state(&condition) => {
            let changed = existing.message != condition.message
                || existing.observed_generation != condition.observed_generation;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
            changed
        }
        Some(existing) => {
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Condition types and reasons shared with external consumers.
///
/// The ServersHealthy/DatabasesHealthy names are an interoperability
/// contract and must not change.
pub mod conditions {
    /// Every server is Enabled and Available
    pub const SERVERS_HEALTHY: &str = "ServersHealthy";
    /// Every requested-online user database is online
    pub const DATABASES_HEALTHY: &str = "DatabasesHealthy";
    /// The spec's topology passed validation
    pub const TOPOLOGY_VALID: &str = "TopologyValid";
    /// Members agree on cluster membership
    pub const MEMBERSHIP_CONSISTENT: &str = "MembershipConsistent";
    /// All members are ready
    pub const READY: &str = "Ready";

    /// ServersHealthy=True
    pub const ALL_SERVERS_HEALTHY: &str = "AllServersHealthy";
    /// ServersHealthy=False
    pub const SERVER_DEGRADED: &str = "ServerDegraded";
    /// DatabasesHealthy=True
    pub const ALL_DATABASES_ONLINE: &str = "AllDatabasesOnline";
    /// DatabasesHealthy=False
    pub const DATABASE_OFFLINE: &str = "DatabaseOffline";
    /// Either health condition could not be computed
    pub const DIAGNOSTICS_UNAVAILABLE: &str = "DiagnosticsUnavailable";

    /// TopologyValid=True
    pub const TOPOLOGY_ACCEPTED: &str = "TopologyAccepted";
    /// TopologyValid=True with warnings
    pub const TOPOLOGY_ACCEPTED_WITH_WARNINGS: &str = "TopologyAcceptedWithWarnings";
    /// TopologyValid=False
    pub const INVALID_TOPOLOGY: &str = "InvalidTopology";

    /// MembershipConsistent=True
    pub const MEMBERSHIP_AGREED: &str = "MembershipAgreed";
    /// MembershipConsistent=False
    pub const PARTITION_DETECTED: &str = "PartitionDetected";
    /// MembershipConsistent=Unknown
    pub const MEMBERSHIP_UNKNOWN: &str = "MembershipUnknown";

    /// Ready=True
    pub const ALL_MEMBERS_READY: &str = "AllMembersReady";
    /// Ready=False
    pub const MEMBERS_NOT_READY: &str = "MembersNotReady";
}
