//! Command line and environment configuration

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use neo4j_cluster::controller::ControllerSettings;
use neo4j_cluster::status::StatusUpdater;
use neo4j_cluster::topology::DEFAULT_MAX_SERVERS;

/// Neo4j operator - reconciles Neo4jEnterpriseCluster resources
#[derive(Parser, Debug)]
#[command(name = "neo4j-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// Operator settings
    #[command(flatten)]
    pub config: OperatorConfig,

    /// Mode to run in
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Run modes
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run as controller (default mode)
    Controller,
}

/// Operator tunables; every flag can also come from the environment
#[derive(Args, Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Only watch clusters in this namespace
    #[arg(long, env = "NEO4J_OPERATOR_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Maximum servers a single cluster may request
    #[arg(long, env = "NEO4J_OPERATOR_MAX_SERVERS", default_value_t = DEFAULT_MAX_SERVERS)]
    pub max_servers: i32,

    /// Quiet window before a configuration change is applied
    #[arg(long, env = "NEO4J_OPERATOR_CONFIG_DEBOUNCE_SECS", default_value_t = 120)]
    pub config_debounce_secs: u64,

    /// Interval of the background diagnostics refresh
    #[arg(long, env = "NEO4J_OPERATOR_HEALTH_REFRESH_SECS", default_value_t = 30)]
    pub health_refresh_secs: u64,

    /// Minimum time between split-brain checks of one cluster
    #[arg(long, env = "NEO4J_OPERATOR_SPLIT_BRAIN_INTERVAL_SECS", default_value_t = 60)]
    pub split_brain_interval_secs: u64,

    /// Deadline for each database query
    #[arg(long, env = "NEO4J_OPERATOR_QUERY_TIMEOUT_SECS", default_value_t = 10)]
    pub query_timeout_secs: u64,

    /// Attempts for one conflicting status write
    #[arg(long, env = "NEO4J_OPERATOR_STATUS_RETRY_ATTEMPTS", default_value_t = 5)]
    pub status_retry_attempts: u32,

    /// Clusters reconciled in parallel
    #[arg(long, env = "NEO4J_OPERATOR_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "NEO4J_OPERATOR_TEXT_LOGS")]
    pub text_logs: bool,
}

impl OperatorConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_servers < 1 {
            anyhow::bail!("max-servers must be at least 1, got {}", self.max_servers);
        }
        if self.query_timeout_secs == 0 {
            anyhow::bail!("query-timeout-secs must be positive");
        }
        if self.health_refresh_secs == 0 {
            anyhow::bail!("health-refresh-secs must be positive");
        }
        if self.status_retry_attempts == 0 {
            anyhow::bail!("status-retry-attempts must be positive");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be positive");
        }
        Ok(())
    }

    /// Controller settings for these flags
    pub fn settings(&self) -> ControllerSettings {
        let mut status_retry = StatusUpdater::default_retry();
        status_retry.max_attempts = self.status_retry_attempts;
        ControllerSettings {
            max_servers: self.max_servers,
            config_debounce: Duration::from_secs(self.config_debounce_secs),
            health_refresh_interval: Duration::from_secs(self.health_refresh_secs),
            split_brain_interval: Duration::from_secs(self.split_brain_interval_secs),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            status_retry,
            ..ControllerSettings::default()
        }
    }
}
