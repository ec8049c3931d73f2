//! Topology validation and scale-transition detection

use kube::ResourceExt;

use neo4j_common::crd::{Neo4jEnterpriseCluster, TopologySpec};
use neo4j_common::Error;

/// Default ceiling on the number of servers in one cluster
pub const DEFAULT_MAX_SERVERS: i32 = 20;

/// A scaling change that needs more than adding members
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleTransition {
    /// One primary becomes several: running members must be reconfigured
    /// and restarted, not only new members added
    ScaleUpSingleToMulti,
}

/// Outcome of a successful validation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyReport {
    /// Non-blocking findings
    pub warnings: Vec<String>,
    /// Scaling transition the convergence engine must handle
    pub transition: Option<ScaleTransition>,
}

impl TopologyReport {
    /// True when validation produced no warnings
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Validate a cluster's topology
///
/// `previous_primaries` is the primary count last converged (0 if the
/// cluster has never been converged).
pub fn validate(
    cluster: &Neo4jEnterpriseCluster,
    previous_primaries: i32,
    max_servers: i32,
) -> Result<TopologyReport, Error> {
    validate_topology(
        &cluster.name_any(),
        &cluster.spec.topology,
        previous_primaries,
        max_servers,
    )
}

/// Validate a topology spec; see [`validate`]
pub fn validate_topology(
    cluster: &str,
    topology: &TopologySpec,
    previous_primaries: i32,
    max_servers: i32,
) -> Result<TopologyReport, Error> {
    if topology.primaries < 1 {
        return Err(Error::validation_for_field(
            cluster,
            "spec.topology.primaries",
            format!("primaries must be at least 1, got {}", topology.primaries),
        ));
    }
    if topology.secondaries < 0 {
        return Err(Error::validation_for_field(
            cluster,
            "spec.topology.secondaries",
            format!("secondaries must not be negative, got {}", topology.secondaries),
        ));
    }
    if topology.servers < 0 {
        return Err(Error::validation_for_field(
            cluster,
            "spec.topology.servers",
            format!("servers must not be negative, got {}", topology.servers),
        ));
    }

    let servers = topology.effective_servers();
    if servers > max_servers {
        return Err(Error::validation_for_field(
            cluster,
            "spec.topology.servers",
            format!("{servers} servers exceeds the maximum of {max_servers}"),
        ));
    }
    let allocations = topology.primaries.saturating_add(topology.secondaries);
    if allocations > servers {
        return Err(Error::validation_for_field(
            cluster,
            "spec.topology",
            format!(
                "{} primaries and {} secondaries need {allocations} servers, only {servers} requested",
                topology.primaries, topology.secondaries
            ),
        ));
    }

    let mut report = TopologyReport::default();
    if topology.primaries % 2 == 0 {
        report.warnings.push(format!(
            "{} primaries is even; an odd count is needed for an unambiguous majority",
            topology.primaries
        ));
    }
    if previous_primaries == 1 && topology.primaries > 1 {
        report.transition = Some(ScaleTransition::ScaleUpSingleToMulti);
    }
    Ok(report)
}
