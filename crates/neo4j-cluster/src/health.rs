//! Periodic diagnostics refresh
//!
//! Between reconciles, healthy clusters are checked on a fixed interval so
//! that server and database conditions stay current even when nothing
//! triggers a watch event. The task is owned by the operator lifecycle:
//! `start` is idempotent and `stop` cancels the task and waits for it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use neo4j_common::crd::{
    conditions, find_condition, ClusterPhase, ConditionStatus, Neo4jEnterpriseCluster,
};

use crate::controller::{refresh_diagnostics, Context};

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the background refresh task
pub struct HealthRefresher {
    ctx: Arc<Context>,
    interval: Duration,
    task: Mutex<Option<RunningTask>>,
}

impl HealthRefresher {
    /// Create a stopped refresher
    pub fn new(ctx: Arc<Context>, interval: Duration) -> Self {
        Self {
            ctx,
            interval,
            task: Mutex::new(None),
        }
    }

    /// Start the refresh task; returns false if it is already running
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(self.ctx.clone(), self.interval, cancel.clone()));
        *task = Some(RunningTask { cancel, handle });
        info!(interval_secs = self.interval.as_secs(), "health refresher started");
        true
    }

    /// Stop the refresh task and wait for it to exit
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "health refresher task ended abnormally");
        }
        info!("health refresher stopped");
    }

    /// Whether the refresh task is running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }
}

async fn run(ctx: Arc<Context>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    refreshed = refresh_all(&ctx) => {
                        debug!(clusters = refreshed, "health refresh complete");
                    }
                }
            }
        }
    }
}

/// Whether every desired member was ready at the last reconcile
///
/// Degraded clusters qualify only when the Ready condition is still True,
/// which means the degradation came from the servers' own health.
fn members_up(cluster: &Neo4jEnterpriseCluster) -> bool {
    match cluster.phase() {
        ClusterPhase::Ready => true,
        ClusterPhase::Degraded => cluster
            .status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, conditions::READY))
            .is_some_and(|c| c.status == ConditionStatus::True),
        _ => false,
    }
}

/// Refresh diagnostics of every cluster with all members up
///
/// Returns how many clusters were refreshed.
pub async fn refresh_all(ctx: &Context) -> usize {
    let clusters = match ctx.kube.list_clusters().await {
        Ok(clusters) => clusters,
        Err(e) => {
            warn!(error = %e, "failed to list clusters for health refresh");
            return 0;
        }
    };
    ctx.forget_deleted(&clusters);

    let healthy: Vec<_> = clusters
        .iter()
        .filter(|c| members_up(c))
        .collect();
    let results = join_all(healthy.iter().map(|c| refresh_diagnostics(c, ctx))).await;
    for (cluster, result) in healthy.iter().zip(&results) {
        if let Err(e) = result {
            warn!(cluster = %cluster.name_any(), error = %e, "health refresh failed");
        }
    }
    healthy.len()
}
