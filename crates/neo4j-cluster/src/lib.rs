//! Reconciliation core for Neo4jEnterpriseCluster resources
//!
//! This crate provides the Kubernetes controller for Neo4jEnterpriseCluster
//! CRDs and the pieces it is built from: topology validation, child object
//! convergence, conflict-retrying status writes, protocol diagnostics,
//! split-brain detection and the periodic health refresher.

#![deny(missing_docs)]

pub mod builder;
pub mod controller;
pub mod converge;
pub mod credentials;
pub mod diagnostics;
pub mod health;
pub mod protocol;
pub mod split_brain;
pub mod status;
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;

// Re-export controller types
pub use controller::{
    error_policy, reconcile, Context, ContextBuilder, ControllerSettings, KubeClient,
    KubeClientImpl,
};
pub use health::HealthRefresher;

// Re-export common error types
pub use neo4j_common::{Error, Result};
