//! Neo4j operator - runs the Neo4jEnterpriseCluster controller
//!
//! The binary wires configuration, telemetry, CRD installation, the
//! controller and the background health refresher together.

pub mod config;
pub mod controller_runner;

pub use neo4j_common::crd;
