//! Neo4jEnterpriseCluster controller implementation
//!
//! This module implements the reconciliation logic for Neo4jEnterpriseCluster
//! resources. Each pass validates the topology, converges the child objects,
//! derives the lifecycle phase from the server StatefulSet and writes status
//! through the conflict-retry updater. Ready clusters additionally get their
//! protocol diagnostics refreshed and, at a slower interval, a split-brain
//! check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use neo4j_common::crd::{
    conditions, find_condition, set_condition, ClusterPhase, Condition, ConditionStatus,
    EndpointStatus, Neo4jEnterpriseCluster, ReplicaStatus,
};
use neo4j_common::events::{
    actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher,
};
use neo4j_common::metrics::{MetricsRegistry, ReconcileTimer};
use neo4j_common::retry::RetryConfig;
use neo4j_common::{Error, OPERATOR_NAME};

use crate::builder::{desired_state, DefaultResourceBuilder, ResourceBuilder, BOLT_PORT, HTTP_PORT};
use crate::converge::{
    ChildKey, ChildKind, ChildObject, ChildStore, Converger, DebounceTracker, KubeChildStore,
    DEFAULT_CONFIG_DEBOUNCE,
};
use crate::credentials::{CredentialsProvider, SecretCredentialsProvider};
use crate::diagnostics::DiagnosticsCollector;
use crate::protocol::http::DEFAULT_QUERY_TIMEOUT;
use crate::protocol::{
    cluster_key, BreakerConfig, CircuitBreakerRegistry, Connector, Endpoint, HttpConnector,
    ProtocolClient,
};
use crate::split_brain::{
    repair, MemberRestarter, PodRestarter, SplitBrainDetector, SplitBrainVerdict,
};
use crate::status::{KubeStatusStore, StatusStore, StatusUpdater};
use crate::topology::{self, ScaleTransition, DEFAULT_MAX_SERVERS};

/// Trait abstracting cluster-wide Kubernetes reads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// List every Neo4jEnterpriseCluster the operator watches
    async fn list_clusters(&self) -> Result<Vec<Neo4jEnterpriseCluster>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    namespace: Option<String>,
}

impl KubeClientImpl {
    /// Create a client scoped to `namespace`, or to all namespaces
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn list_clusters(&self) -> Result<Vec<Neo4jEnterpriseCluster>, Error> {
        let api: Api<Neo4jEnterpriseCluster> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Tunables for the reconciler and its background tasks
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Ceiling on servers per cluster
    pub max_servers: i32,
    /// Quiet window for configuration changes
    pub config_debounce: Duration,
    /// Period of the background diagnostics refresh
    pub health_refresh_interval: Duration,
    /// Minimum time between split-brain checks of one cluster
    pub split_brain_interval: Duration,
    /// Deadline for each protocol query
    pub query_timeout: Duration,
    /// Retry policy for status writes
    pub status_retry: RetryConfig,
    /// Requeue delay for Ready clusters
    pub ready_requeue: Duration,
    /// Requeue delay for clusters still converging
    pub progress_requeue: Duration,
    /// Per-cluster circuit breaker tuning
    pub breaker: BreakerConfig,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_servers: DEFAULT_MAX_SERVERS,
            config_debounce: DEFAULT_CONFIG_DEBOUNCE,
            health_refresh_interval: Duration::from_secs(30),
            split_brain_interval: Duration::from_secs(60),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            status_retry: StatusUpdater::default_retry(),
            ready_requeue: Duration::from_secs(60),
            progress_requeue: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Controller context shared by reconciles and the health refresher
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .settings(settings)
///     .build()?;
/// ```
pub struct Context {
    /// Kubernetes reads (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// The only writer of cluster status
    pub status: StatusUpdater,
    /// Child object access
    pub children: Arc<dyn ChildStore>,
    /// Desired child objects
    pub builder: Arc<dyn ResourceBuilder>,
    /// Opens database sessions
    pub connector: Arc<dyn Connector>,
    /// Resolves cluster credentials
    pub credentials: Arc<dyn CredentialsProvider>,
    /// Restarts partitioned members
    pub restarter: Arc<dyn MemberRestarter>,
    /// Per-cluster circuit breakers
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Kubernetes event sink
    pub events: Arc<dyn EventPublisher>,
    /// Metrics registry
    pub metrics: MetricsRegistry,
    /// Configuration changes waiting out their quiet window
    pub debounce: Arc<DebounceTracker>,
    /// Diagnostics collection
    pub diagnostics: DiagnosticsCollector,
    /// Split-brain detection
    pub split_brain: SplitBrainDetector,
    /// Tunables
    pub settings: ControllerSettings,
    last_split_brain_check: DashMap<String, Instant>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(Some(client))
    }

    /// Builder without a Kubernetes client; every collaborator must be set
    #[cfg(test)]
    pub(crate) fn test_builder() -> ContextBuilder {
        ContextBuilder::new(None)
    }

    /// Claim the split-brain check for a cluster if its interval has elapsed
    pub fn split_brain_due(&self, cluster: &str, now: Instant) -> bool {
        let interval = self.settings.split_brain_interval;
        match self.last_split_brain_check.entry(cluster.to_string()) {
            Entry::Occupied(mut last) => {
                if now.saturating_duration_since(*last.get()) < interval {
                    return false;
                }
                last.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Drop in-memory state of clusters that no longer exist
    pub fn forget_deleted(&self, live: &[Neo4jEnterpriseCluster]) {
        let live: std::collections::HashSet<String> = live.iter().map(cluster_key).collect();
        let mut known = self.breakers.clusters();
        known.extend(self.last_split_brain_check.iter().map(|e| e.key().clone()));
        known.extend(
            self.metrics
                .clusters_with_server_health()
                .into_iter()
                .map(|(namespace, name)| format!("{namespace}/{name}")),
        );
        known.sort();
        known.dedup();
        for key in known {
            if live.contains(&key) {
                continue;
            }
            debug!(cluster = %key, "forgetting state of deleted cluster");
            self.breakers.forget(&key);
            self.last_split_brain_check.remove(&key);
            if let Some((namespace, name)) = key.split_once('/') {
                self.debounce.forget(&ChildKey::owned_by(namespace, name));
                self.metrics.forget_cluster(namespace, name);
            }
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// Collaborators not set explicitly are created from the Kubernetes client.
pub struct ContextBuilder {
    client: Option<Client>,
    settings: ControllerSettings,
    watch_namespace: Option<String>,
    kube: Option<Arc<dyn KubeClient>>,
    status_store: Option<Arc<dyn StatusStore>>,
    children: Option<Arc<dyn ChildStore>>,
    builder: Option<Arc<dyn ResourceBuilder>>,
    connector: Option<Arc<dyn Connector>>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    restarter: Option<Arc<dyn MemberRestarter>>,
    events: Option<Arc<dyn EventPublisher>>,
    metrics: Option<MetricsRegistry>,
}

impl ContextBuilder {
    fn new(client: Option<Client>) -> Self {
        Self {
            client,
            settings: ControllerSettings::default(),
            watch_namespace: None,
            kube: None,
            status_store: None,
            children: None,
            builder: None,
            connector: None,
            credentials: None,
            restarter: None,
            events: None,
            metrics: None,
        }
    }

    /// Set the controller tunables
    pub fn settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Restrict cluster listing to one namespace
    pub fn watch_namespace(mut self, namespace: Option<String>) -> Self {
        self.watch_namespace = namespace;
        self
    }

    /// Use an explicit metrics registry
    pub fn metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the status store (primarily for testing)
    pub fn status_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    /// Override the child store (primarily for testing)
    pub fn child_store(mut self, store: Arc<dyn ChildStore>) -> Self {
        self.children = Some(store);
        self
    }

    /// Use a different resource builder
    pub fn resource_builder(mut self, builder: Arc<dyn ResourceBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Override the protocol connector
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Override the credentials provider (primarily for testing)
    pub fn credentials(mut self, credentials: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Override the member restarter (primarily for testing)
    pub fn restarter(mut self, restarter: Arc<dyn MemberRestarter>) -> Self {
        self.restarter = Some(restarter);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let client = self.client;
        let from_client = |what: &str| -> Result<Client, Error> {
            client.clone().ok_or_else(|| {
                Error::internal_with_context(
                    "context",
                    format!("{what} needs a Kubernetes client"),
                )
            })
        };

        let kube: Arc<dyn KubeClient> = match self.kube {
            Some(k) => k,
            None => Arc::new(KubeClientImpl::new(
                from_client("cluster listing")?,
                self.watch_namespace.clone(),
            )),
        };
        let status_store: Arc<dyn StatusStore> = match self.status_store {
            Some(s) => s,
            None => Arc::new(KubeStatusStore::new(from_client("status store")?)),
        };
        let children: Arc<dyn ChildStore> = match self.children {
            Some(c) => c,
            None => Arc::new(KubeChildStore::new(from_client("child store")?)),
        };
        let credentials: Arc<dyn CredentialsProvider> = match self.credentials {
            Some(c) => c,
            None => Arc::new(SecretCredentialsProvider::new(from_client("credentials")?)),
        };
        let restarter: Arc<dyn MemberRestarter> = match self.restarter {
            Some(r) => r,
            None => Arc::new(PodRestarter::new(from_client("member restarts")?)),
        };
        let events: Arc<dyn EventPublisher> = match (self.events, &client) {
            (Some(e), _) => e,
            (None, Some(c)) => Arc::new(KubeEventPublisher::new(c.clone(), OPERATOR_NAME)),
            (None, None) => Arc::new(NoopEventPublisher),
        };
        let connector: Arc<dyn Connector> = match self.connector {
            Some(c) => c,
            None => Arc::new(HttpConnector::new(self.settings.query_timeout)?),
        };
        let metrics = self.metrics.unwrap_or_default();

        Ok(Context {
            kube,
            status: StatusUpdater::new(status_store, self.settings.status_retry.clone()),
            children,
            builder: self
                .builder
                .unwrap_or_else(|| Arc::new(DefaultResourceBuilder)),
            split_brain: SplitBrainDetector::new(connector.clone(), self.settings.query_timeout),
            connector,
            credentials,
            restarter,
            breakers: Arc::new(CircuitBreakerRegistry::new(self.settings.breaker)),
            events,
            diagnostics: DiagnosticsCollector::new(self.settings.query_timeout, metrics.clone()),
            metrics,
            debounce: Arc::new(DebounceTracker::new(self.settings.config_debounce)),
            settings: self.settings,
            last_split_brain_check: DashMap::new(),
        })
    }
}

/// Rollout state of the server StatefulSet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerSetObservation {
    /// Servers the spec asks for
    pub desired: i32,
    /// Pods passing readiness
    pub ready: i32,
    /// Pods on the latest template
    pub updated: i32,
    /// A template change is still rolling out
    pub rolling: bool,
}

impl ServerSetObservation {
    /// Observe a live StatefulSet, or its absence
    pub fn from_stateful_set(sts: Option<&StatefulSet>, desired: i32) -> Self {
        let status = sts.and_then(|s| s.status.as_ref());
        let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
        let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
        let revision_pending = status
            .map(|s| s.update_revision.is_some() && s.current_revision != s.update_revision)
            .unwrap_or(false);
        let stale = match (
            sts.and_then(|s| s.metadata.generation),
            status.and_then(|s| s.observed_generation),
        ) {
            (Some(generation), Some(observed)) => observed < generation,
            _ => false,
        };
        Self {
            desired,
            ready,
            updated,
            rolling: revision_pending || stale || updated < desired,
        }
    }

    /// Every desired server is ready
    pub fn all_ready(&self) -> bool {
        self.desired > 0 && self.ready >= self.desired
    }
}

/// Lifecycle phase from the previous phase and what is running now
///
/// `servers_healthy` is the last `ServersHealthy` status, if any.
pub fn derive_phase(
    previous: ClusterPhase,
    observed: &ServerSetObservation,
    image_changed: bool,
    servers_healthy: Option<ConditionStatus>,
) -> ClusterPhase {
    if image_changed && observed.rolling {
        return ClusterPhase::Upgrading;
    }
    let was_ready = matches!(
        previous,
        ClusterPhase::Ready | ClusterPhase::Degraded | ClusterPhase::Upgrading
    );
    if observed.all_ready() {
        if was_ready && servers_healthy == Some(ConditionStatus::False) {
            ClusterPhase::Degraded
        } else {
            ClusterPhase::Ready
        }
    } else if was_ready {
        ClusterPhase::Degraded
    } else if observed.ready > 0 {
        ClusterPhase::Forming
    } else {
        ClusterPhase::Pending
    }
}

/// Client-facing endpoints of a cluster
pub fn endpoints(cluster: &Neo4jEnterpriseCluster) -> EndpointStatus {
    let namespace = cluster.namespace_or_default();
    let host = format!("{}.{}.svc.cluster.local", cluster.client_service_name(), namespace);
    EndpointStatus {
        bolt: Some(format!("neo4j://{host}:{BOLT_PORT}")),
        http: Some(format!("http://{host}:{HTTP_PORT}")),
        headless: Some(format!(
            "{}.{}.svc.cluster.local",
            cluster.headless_service_name(),
            namespace
        )),
    }
}

/// Reconcile a Neo4jEnterpriseCluster resource
///
/// Returns an `Action` indicating when to requeue the resource, or an error
/// if reconciliation failed and should be retried.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(
    cluster: Arc<Neo4jEnterpriseCluster>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(&ctx.metrics, cluster_key(&cluster));
    match reconcile_cluster(&cluster, &ctx).await {
        Ok(action) => {
            timer.success();
            Ok(action)
        }
        Err(e) => {
            timer.error(e.error_type());
            Err(e)
        }
    }
}

async fn reconcile_cluster(
    cluster: &Neo4jEnterpriseCluster,
    ctx: &Context,
) -> Result<Action, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();
    let generation = cluster.generation();
    let previous = cluster.status.clone().unwrap_or_default();
    info!(generation, phase = %previous.phase, "reconciling cluster");

    let report = match topology::validate(
        cluster,
        previous.replicas.primaries,
        ctx.settings.max_servers,
    ) {
        Ok(report) => report,
        Err(e @ Error::Validation { .. }) => {
            mark_invalid(cluster, ctx, &e).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    let reference = cluster.object_ref(&());
    let new_generation = previous.observed_generation != Some(generation);
    if !report.is_clean() && new_generation {
        ctx.events
            .publish(
                &reference,
                EventType::Warning,
                reasons::TOPOLOGY_WARNING,
                actions::VALIDATE,
                Some(report.warnings.join("; ")),
            )
            .await;
    }
    if report.transition == Some(ScaleTransition::ScaleUpSingleToMulti) {
        info!(
            primaries = cluster.spec.topology.primaries,
            "scaling from a single primary to a cluster, restarting existing members"
        );
        ctx.events
            .publish(
                &reference,
                EventType::Normal,
                reasons::SCALE_TO_CLUSTER,
                actions::SCALE,
                Some(format!(
                    "reconfiguring for {} primaries",
                    cluster.spec.topology.primaries
                )),
            )
            .await;
    }

    let desired = desired_state(ctx.builder.as_ref(), cluster)?;
    let converged = Converger::new(ctx.children.as_ref(), &ctx.debounce)
        .converge(desired, report.transition, generation, Instant::now())
        .await?;
    debug!(
        applied = converged.applied.len(),
        skipped = converged.skipped.len(),
        pending = converged.pending.len(),
        "children converged"
    );

    let set_key = ChildKey {
        kind: ChildKind::StatefulSet,
        namespace: namespace.clone(),
        name: cluster.server_set_name(),
    };
    let live_set = match ctx.children.get(&set_key).await? {
        Some(ChildObject::StatefulSet(sts)) => Some(sts),
        _ => None,
    };
    let topology = &cluster.spec.topology;
    let observed =
        ServerSetObservation::from_stateful_set(live_set.as_ref(), topology.effective_servers());

    let image = cluster.spec.image.reference();
    let image_changed = previous.image.as_deref().is_some_and(|i| i != image);
    let servers_healthy = find_condition(&previous.conditions, conditions::SERVERS_HEALTHY);
    let phase = derive_phase(
        previous.phase,
        &observed,
        image_changed,
        servers_healthy.map(|c| c.status),
    );

    let mut message = match phase {
        ClusterPhase::Upgrading => format!(
            "Rolling out {image}: {}/{} servers updated",
            observed.updated, observed.desired
        ),
        ClusterPhase::Degraded if observed.all_ready() => servers_healthy
            .map(|c| c.message.clone())
            .unwrap_or_else(|| "servers unhealthy".to_string()),
        _ => format!("{}/{} servers ready", observed.ready, observed.desired),
    };
    if !converged.pending.is_empty() {
        message.push_str("; configuration change pending");
    }

    let topology_condition = if report.is_clean() {
        Condition::new(
            conditions::TOPOLOGY_VALID,
            ConditionStatus::True,
            conditions::TOPOLOGY_ACCEPTED,
            format!(
                "{} primaries, {} secondaries on {} servers",
                topology.primaries,
                topology.secondaries,
                topology.effective_servers()
            ),
        )
    } else {
        Condition::new(
            conditions::TOPOLOGY_VALID,
            ConditionStatus::True,
            conditions::TOPOLOGY_ACCEPTED_WITH_WARNINGS,
            report.warnings.join("; "),
        )
    }
    .generation(generation);
    let ready_condition = if observed.all_ready() {
        Condition::new(
            conditions::READY,
            ConditionStatus::True,
            conditions::ALL_MEMBERS_READY,
            format!("{}/{} servers ready", observed.ready, observed.desired),
        )
    } else {
        Condition::new(
            conditions::READY,
            ConditionStatus::False,
            conditions::MEMBERS_NOT_READY,
            format!("{}/{} servers ready", observed.ready, observed.desired),
        )
    }
    .generation(generation);

    let replicas = ReplicaStatus {
        primaries: topology.primaries,
        secondaries: topology.secondaries,
        ready: observed.ready,
    };
    let endpoints = endpoints(cluster);
    ctx.status
        .update_status(&namespace, &name, |s| {
            s.observed_generation = Some(generation);
            s.phase = phase;
            s.message = Some(message.clone());
            s.replicas = replicas.clone();
            s.endpoints = endpoints.clone();
            if phase == ClusterPhase::Ready {
                s.image = Some(image.clone());
            }
            set_condition(&mut s.conditions, topology_condition.clone());
            set_condition(&mut s.conditions, ready_condition.clone());
        })
        .await?;

    if phase != previous.phase {
        info!(from = %previous.phase, to = %phase, "cluster phase changed");
        match phase {
            ClusterPhase::Ready => {
                ctx.events
                    .publish(
                        &reference,
                        EventType::Normal,
                        reasons::CLUSTER_READY,
                        actions::RECONCILE,
                        Some(message.clone()),
                    )
                    .await
            }
            ClusterPhase::Degraded => {
                ctx.events
                    .publish(
                        &reference,
                        EventType::Warning,
                        reasons::CLUSTER_DEGRADED,
                        actions::RECONCILE,
                        Some(message.clone()),
                    )
                    .await
            }
            _ => {}
        }
    }

    if observed.all_ready() {
        if let Err(e) = refresh_diagnostics(cluster, ctx).await {
            warn!(error = %e, "failed to publish diagnostics");
        }
    }
    if phase == ClusterPhase::Ready {
        if let Err(e) = check_split_brain(cluster, ctx).await {
            warn!(error = %e, "split-brain check failed");
        }
    }

    let mut requeue = if phase == ClusterPhase::Ready {
        ctx.settings.ready_requeue
    } else {
        ctx.settings.progress_requeue
    };
    if let Some(next) = converged.next_check {
        requeue = requeue.min(next);
    }
    Ok(Action::requeue(requeue))
}

/// Record a validation failure; the cluster waits for a spec change
async fn mark_invalid(
    cluster: &Neo4jEnterpriseCluster,
    ctx: &Context,
    error: &Error,
) -> Result<(), Error> {
    let generation = cluster.generation();
    let message = error.to_string();
    warn!(error = %message, "topology rejected");

    let condition = Condition::new(
        conditions::TOPOLOGY_VALID,
        ConditionStatus::False,
        conditions::INVALID_TOPOLOGY,
        message.clone(),
    )
    .generation(generation);
    ctx.status
        .update_status(&cluster.namespace_or_default(), &cluster.name_any(), |s| {
            s.observed_generation = Some(generation);
            s.phase = ClusterPhase::Failed;
            s.message = Some(message.clone());
            set_condition(&mut s.conditions, condition.clone());
        })
        .await?;

    let previous = cluster.status.as_ref();
    let already_reported = previous.is_some_and(|s| {
        s.phase == ClusterPhase::Failed && s.message.as_deref() == Some(message.as_str())
    });
    if !already_reported {
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::VALIDATE,
                Some(message),
            )
            .await;
    }
    Ok(())
}

/// Collect and publish diagnostics for one cluster
///
/// Connection failures are published as an unavailable snapshot; only a
/// failed status write is returned as an error.
pub async fn refresh_diagnostics(
    cluster: &Neo4jEnterpriseCluster,
    ctx: &Context,
) -> Result<(), Error> {
    let credentials = match ctx.credentials.credentials(cluster).await {
        Ok(c) => c,
        Err(e) => {
            warn!(cluster = %cluster.name_any(), error = %e, "cannot resolve credentials");
            ctx.diagnostics
                .publish_unavailable(cluster, &e, &ctx.status)
                .await?;
            return Ok(());
        }
    };

    let endpoint = Endpoint::for_cluster(cluster);
    match ctx
        .breakers
        .connect(ctx.connector.as_ref(), &endpoint, &credentials)
        .await
    {
        Ok(session) => {
            let result = ctx.diagnostics.refresh(cluster, &session, &ctx.status).await;
            session.close().await;
            result?;
        }
        Err(e) => {
            warn!(cluster = %cluster.name_any(), error = %e, "diagnostics connection failed");
            ctx.diagnostics
                .publish_unavailable(cluster, &e, &ctx.status)
                .await?;
        }
    }
    Ok(())
}

/// Run a split-brain check if one is due, and repair a detected partition
async fn check_split_brain(cluster: &Neo4jEnterpriseCluster, ctx: &Context) -> Result<(), Error> {
    if !ctx.split_brain_due(&cluster_key(cluster), Instant::now()) {
        return Ok(());
    }
    let credentials = ctx.credentials.credentials(cluster).await?;
    let verdict = ctx.split_brain.detect(cluster, &credentials).await;
    debug!(?verdict, "split-brain check complete");

    let condition = verdict.condition(cluster.generation());
    let namespace = cluster.namespace_or_default();
    ctx.status
        .update_status(&namespace, &cluster.name_any(), |s| {
            set_condition(&mut s.conditions, condition.clone());
        })
        .await?;

    let SplitBrainVerdict::Partitioned { majority, minority } = verdict else {
        return Ok(());
    };
    error!(
        majority = %majority.join(","),
        minority = %minority.join(","),
        "cluster partition detected, restarting minority members"
    );
    let reference = cluster.object_ref(&());
    ctx.events
        .publish(
            &reference,
            EventType::Warning,
            reasons::PARTITION_DETECTED,
            actions::REPAIR,
            Some(format!(
                "members {} are partitioned from {}",
                minority.join(", "),
                majority.join(", ")
            )),
        )
        .await;

    let outcome = repair(ctx.restarter.as_ref(), &namespace, &minority).await;
    for member in &outcome.restarted {
        ctx.events
            .publish(
                &reference,
                EventType::Normal,
                reasons::MEMBER_RESTARTED,
                actions::REPAIR,
                Some(format!("restarted partitioned member {member}")),
            )
            .await;
    }
    for (member, error) in &outcome.failed {
        ctx.events
            .publish(
                &reference,
                EventType::Warning,
                reasons::MEMBER_RESTART_FAILED,
                actions::REPAIR,
                Some(format!("failed to restart {member}: {error}")),
            )
            .await;
    }
    Ok(())
}

/// Error policy for the controller
///
/// Validation errors never reach here: reconcile turns them into a Failed
/// phase and waits for a spec change.
pub fn error_policy(
    cluster: Arc<Neo4jEnterpriseCluster>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credentials, MockCredentialsProvider};
    use crate::protocol::MockConnector;
    use crate::split_brain::MockMemberRestarter;
    use crate::testing::{cluster, server, MemoryStatusStore, StaticConnector};
    use k8s_openapi::api::apps::v1::StatefulSetStatus;
    use neo4j_common::crd::{Neo4jEnterpriseClusterStatus, ServerDiagnostic};
    use neo4j_common::events::RecordingEventPublisher;
    use neo4j_common::kube_utils::RESTART_GENERATION_ANNOTATION;
    use neo4j_common::metrics::ServerSeries;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Child store that keeps StatefulSet status across applies, like the
    /// API server does for spec-only applies
    #[derive(Default)]
    struct FakeChildStore {
        objects: Mutex<HashMap<ChildKey, ChildObject>>,
    }

    impl FakeChildStore {
        fn set_rollout(&self, ready: i32, updated: i32) {
            let mut objects = self.objects.lock();
            for object in objects.values_mut() {
                if let ChildObject::StatefulSet(sts) = object {
                    sts.status = Some(StatefulSetStatus {
                        replicas: ready,
                        ready_replicas: Some(ready),
                        updated_replicas: Some(updated),
                        ..Default::default()
                    });
                }
            }
        }

        fn stateful_set(&self) -> StatefulSet {
            self.objects
                .lock()
                .values()
                .find_map(|o| match o {
                    ChildObject::StatefulSet(s) => Some(s.clone()),
                    _ => None,
                })
                .unwrap()
        }
    }

    #[async_trait]
    impl ChildStore for FakeChildStore {
        async fn get(&self, key: &ChildKey) -> Result<Option<ChildObject>, Error> {
            Ok(self.objects.lock().get(key).cloned())
        }

        async fn apply(&self, object: &ChildObject) -> Result<(), Error> {
            let mut objects = self.objects.lock();
            let key = object.key();
            let mut object = object.clone();
            if let (ChildObject::StatefulSet(new), Some(ChildObject::StatefulSet(old))) =
                (&mut object, objects.get(&key))
            {
                new.status = old.status.clone();
            }
            objects.insert(key, object);
            Ok(())
        }
    }

    struct Harness {
        ctx: Arc<Context>,
        status: Arc<MemoryStatusStore>,
        children: Arc<FakeChildStore>,
        events: Arc<RecordingEventPublisher>,
        connector: Arc<StaticConnector>,
    }

    impl Harness {
        fn new(
            cluster: Neo4jEnterpriseCluster,
            servers: Vec<ServerDiagnostic>,
            restarter: MockMemberRestarter,
        ) -> Self {
            let status = Arc::new(MemoryStatusStore::new(cluster));
            let children = Arc::new(FakeChildStore::default());
            let events = Arc::new(RecordingEventPublisher::default());
            let connector = Arc::new(StaticConnector::new(servers));
            let mut credentials = MockCredentialsProvider::new();
            credentials
                .expect_credentials()
                .returning(|_| Ok(Credentials::new("neo4j", "secret")));

            let ctx = Context::test_builder()
                .kube_client(Arc::new(MockKubeClient::new()))
                .status_store(status.clone())
                .child_store(children.clone())
                .connector(connector.clone())
                .credentials(Arc::new(credentials))
                .restarter(Arc::new(restarter))
                .events(events.clone())
                .build()
                .unwrap();
            Self {
                ctx: Arc::new(ctx),
                status,
                children,
                events,
                connector,
            }
        }

        async fn reconcile(&self) -> Action {
            reconcile(Arc::new(self.status.cluster()), self.ctx.clone())
                .await
                .unwrap()
        }

        fn status(&self) -> Neo4jEnterpriseClusterStatus {
            self.status.cluster().status.unwrap_or_default()
        }
    }

    fn healthy_servers(n: usize) -> Vec<ServerDiagnostic> {
        (0..n)
            .map(|i| {
                let mut s = server(&format!("s{i}"), "Enabled", "Available");
                s.address = format!("graph-server-{i}.graph-headless.db.svc.cluster.local:7687");
                s
            })
            .collect()
    }

    fn observation(desired: i32, ready: i32, rolling: bool) -> ServerSetObservation {
        ServerSetObservation {
            desired,
            ready,
            updated: if rolling { 0 } else { desired },
            rolling,
        }
    }

    #[test]
    fn phase_follows_the_server_set() {
        use ClusterPhase::*;
        let healthy = Some(ConditionStatus::True);
        assert_eq!(derive_phase(Pending, &observation(3, 0, true), false, None), Pending);
        assert_eq!(derive_phase(Pending, &observation(3, 1, true), false, None), Forming);
        assert_eq!(derive_phase(Forming, &observation(3, 3, false), false, None), Ready);
        assert_eq!(derive_phase(Ready, &observation(3, 2, false), false, healthy), Degraded);
        assert_eq!(derive_phase(Degraded, &observation(3, 3, false), false, healthy), Ready);
        assert_eq!(
            derive_phase(Ready, &observation(3, 3, false), false, Some(ConditionStatus::False)),
            Degraded
        );
        assert_eq!(derive_phase(Ready, &observation(3, 3, true), true, healthy), Upgrading);
        assert_eq!(derive_phase(Upgrading, &observation(3, 3, false), true, healthy), Ready);
    }

    #[test]
    fn observation_reads_rollout_progress() {
        let mut sts = StatefulSet::default();
        sts.metadata.generation = Some(2);
        sts.status = Some(StatefulSetStatus {
            replicas: 3,
            ready_replicas: Some(3),
            updated_replicas: Some(3),
            observed_generation: Some(1),
            ..Default::default()
        });
        let observed = ServerSetObservation::from_stateful_set(Some(&sts), 3);
        assert!(observed.all_ready());
        assert!(observed.rolling, "controller has not observed the new template yet");

        let missing = ServerSetObservation::from_stateful_set(None, 3);
        assert_eq!(missing.ready, 0);
        assert!(!missing.all_ready());
    }

    #[tokio::test]
    async fn invalid_topology_fails_and_waits_for_a_change() {
        let mut c = cluster(3, 0);
        c.spec.topology.primaries = 0;
        let h = Harness::new(c, vec![], MockMemberRestarter::new());

        let action = h.reconcile().await;
        assert_eq!(action, Action::await_change());

        let status = h.status();
        assert_eq!(status.phase, ClusterPhase::Failed);
        let condition = find_condition(&status.conditions, conditions::TOPOLOGY_VALID).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, conditions::INVALID_TOPOLOGY);
        assert!(h.children.objects.lock().is_empty());
        assert_eq!(h.events.with_reason(reasons::VALIDATION_FAILED).len(), 1);

        // Same failure again is not re-announced
        h.reconcile().await;
        assert_eq!(h.events.with_reason(reasons::VALIDATION_FAILED).len(), 1);
    }

    #[tokio::test]
    async fn first_pass_creates_children_and_reports_pending() {
        let h = Harness::new(cluster(3, 0), vec![], MockMemberRestarter::new());
        let action = h.reconcile().await;
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));

        assert_eq!(h.children.objects.lock().len(), 4);
        let status = h.status();
        assert_eq!(status.phase, ClusterPhase::Pending);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.replicas.primaries, 3);
        assert_eq!(
            status.endpoints.bolt.as_deref(),
            Some("neo4j://graph.db.svc.cluster.local:7687")
        );
        let topology = find_condition(&status.conditions, conditions::TOPOLOGY_VALID).unwrap();
        assert_eq!(topology.reason, conditions::TOPOLOGY_ACCEPTED);
        assert_eq!(h.connector.connects(), 0, "no diagnostics before Ready");
    }

    #[tokio::test]
    async fn ready_cluster_gets_diagnostics_and_membership() {
        let h = Harness::new(cluster(3, 0), healthy_servers(3), MockMemberRestarter::new());
        h.reconcile().await;
        h.children.set_rollout(3, 3);

        let action = h.reconcile().await;
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));

        let status = h.status();
        assert_eq!(status.phase, ClusterPhase::Ready);
        assert_eq!(status.image.as_deref(), Some(cluster(3, 0).spec.image.reference().as_str()));
        let servers = find_condition(&status.conditions, conditions::SERVERS_HEALTHY).unwrap();
        assert_eq!(servers.status, ConditionStatus::True);
        let membership =
            find_condition(&status.conditions, conditions::MEMBERSHIP_CONSISTENT).unwrap();
        assert_eq!(membership.reason, conditions::MEMBERSHIP_AGREED);
        assert_eq!(h.events.with_reason(reasons::CLUSTER_READY).len(), 1);
        // One diagnostics session plus one view query per member
        assert_eq!(h.connector.connects(), 4);
    }

    #[tokio::test]
    async fn lost_member_degrades_a_ready_cluster() {
        let h = Harness::new(cluster(3, 0), healthy_servers(3), MockMemberRestarter::new());
        h.reconcile().await;
        h.children.set_rollout(3, 3);
        h.reconcile().await;

        h.children.set_rollout(2, 3);
        h.reconcile().await;
        let status = h.status();
        assert_eq!(status.phase, ClusterPhase::Degraded);
        assert_eq!(status.message.as_deref(), Some("2/3 servers ready"));
        assert_eq!(h.events.with_reason(reasons::CLUSTER_DEGRADED).len(), 1);
    }

    #[tokio::test]
    async fn image_change_reports_upgrading_until_rolled_out() {
        let h = Harness::new(cluster(3, 0), healthy_servers(3), MockMemberRestarter::new());
        h.reconcile().await;
        h.children.set_rollout(3, 3);
        h.reconcile().await;

        let mut upgraded = h.status.cluster();
        upgraded.spec.image.tag = "5.26.0-enterprise".to_string();
        upgraded.metadata.generation = Some(2);
        h.status.replace_spec(upgraded);
        h.children.set_rollout(3, 1);
        h.reconcile().await;
        assert_eq!(h.status().phase, ClusterPhase::Upgrading);

        h.children.set_rollout(3, 3);
        h.reconcile().await;
        let status = h.status();
        assert_eq!(status.phase, ClusterPhase::Ready);
        assert!(status.image.unwrap().ends_with("5.26.0-enterprise"));
    }

    #[tokio::test]
    async fn single_to_multi_restarts_existing_members() {
        let h = Harness::new(cluster(1, 0), vec![], MockMemberRestarter::new());
        h.reconcile().await;
        let template = |h: &Harness| {
            h.children
                .stateful_set()
                .spec
                .unwrap()
                .template
                .metadata
                .unwrap()
                .annotations
                .unwrap_or_default()
        };
        assert!(!template(&h).contains_key(RESTART_GENERATION_ANNOTATION));

        let mut scaled = h.status.cluster();
        scaled.spec.topology.primaries = 3;
        scaled.spec.topology.servers = 3;
        scaled.metadata.generation = Some(2);
        h.status.replace_spec(scaled);
        h.reconcile().await;

        assert_eq!(
            template(&h).get(RESTART_GENERATION_ANNOTATION).map(String::as_str),
            Some("2")
        );
        assert_eq!(h.events.with_reason(reasons::SCALE_TO_CLUSTER).len(), 1);
        assert_eq!(h.status().replicas.primaries, 3);

        // Next pass is no longer a transition and restarts nothing new
        h.reconcile().await;
        assert_eq!(h.events.with_reason(reasons::SCALE_TO_CLUSTER).len(), 1);
    }

    #[tokio::test]
    async fn partition_restarts_the_minority() {
        let mut restarter = MockMemberRestarter::new();
        restarter
            .expect_restart_member()
            .withf(|ns, member| ns == "db" && member == "graph-server-2")
            .times(1)
            .returning(|_, _| Ok(()));

        let h = Harness::new(cluster(3, 0), healthy_servers(3), restarter);
        // graph-server-2 only sees itself; the others only see each other
        h.connector.isolate("graph-server-2");

        h.reconcile().await;
        h.children.set_rollout(3, 3);
        h.reconcile().await;

        let status = h.status();
        let membership =
            find_condition(&status.conditions, conditions::MEMBERSHIP_CONSISTENT).unwrap();
        assert_eq!(membership.status, ConditionStatus::False);
        assert_eq!(membership.reason, conditions::PARTITION_DETECTED);
        assert_eq!(h.events.with_reason(reasons::PARTITION_DETECTED).len(), 1);
        assert_eq!(h.events.with_reason(reasons::MEMBER_RESTARTED).len(), 1);
    }

    #[tokio::test]
    async fn unreachable_database_marks_diagnostics_unavailable() {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|endpoint, _| {
            Err(endpoint.error(
                neo4j_common::error::ProtocolErrorKind::Connection,
                "connection refused",
            ))
        });
        let mut c = cluster(3, 0);
        c.status = Some(Neo4jEnterpriseClusterStatus::with_phase(ClusterPhase::Ready));
        let status = Arc::new(MemoryStatusStore::new(c.clone()));
        let mut credentials = MockCredentialsProvider::new();
        credentials
            .expect_credentials()
            .returning(|_| Ok(Credentials::new("neo4j", "secret")));
        let ctx = Context::test_builder()
            .kube_client(Arc::new(MockKubeClient::new()))
            .status_store(status.clone())
            .child_store(Arc::new(FakeChildStore::default()))
            .connector(Arc::new(connector))
            .credentials(Arc::new(credentials))
            .restarter(Arc::new(MockMemberRestarter::new()))
            .build()
            .unwrap();

        refresh_diagnostics(&c, &ctx).await.unwrap();
        let written = status.cluster().status.unwrap();
        let servers = find_condition(&written.conditions, conditions::SERVERS_HEALTHY).unwrap();
        assert_eq!(servers.status, ConditionStatus::Unknown);
        assert_eq!(servers.reason, conditions::DIAGNOSTICS_UNAVAILABLE);
        assert!(written
            .diagnostics
            .unwrap()
            .collection_error
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn split_brain_checks_are_rate_limited() {
        let h = Harness::new(cluster(3, 0), vec![], MockMemberRestarter::new());
        let start = Instant::now();
        assert!(h.ctx.split_brain_due("db/graph", start));
        assert!(!h.ctx.split_brain_due("db/graph", start + Duration::from_secs(10)));
        assert!(h.ctx.split_brain_due("db/graph", start + Duration::from_secs(61)));
        assert!(h.ctx.split_brain_due("db/other", start));

        h.ctx.forget_deleted(&[]);
        assert!(h.ctx.split_brain_due("db/graph", start));
    }

    #[tokio::test]
    async fn deleted_clusters_release_metrics_and_pending_changes() {
        let h = Harness::new(cluster(3, 0), vec![], MockMemberRestarter::new());
        let series = |name: &str| ServerSeries {
            cluster: name.to_string(),
            namespace: "db".to_string(),
            server_name: "s0".to_string(),
            server_address: "s0:7687".to_string(),
        };
        h.ctx.metrics.record_server_health(series("graph"), true);
        h.ctx.metrics.record_server_health(series("gone"), true);

        let t0 = Instant::now();
        for name in ["gone", "graph-2"] {
            let config = ChildKey::owned_by("db", name)
                .into_iter()
                .find(|k| k.kind == ChildKind::ConfigMap)
                .unwrap();
            h.ctx.debounce.observe(&config, "new", Some("old"), t0);
        }

        let mut sibling = cluster(3, 0);
        sibling.metadata.name = Some("graph-2".to_string());
        h.ctx.forget_deleted(&[cluster(3, 0), sibling]);

        assert_eq!(
            h.ctx.metrics.clusters_with_server_health(),
            [("db".to_string(), "graph".to_string())]
        );
        assert_eq!(h.ctx.debounce.pending_count(), 1);
    }

    #[test]
    fn builder_without_client_needs_every_collaborator() {
        let err = Context::test_builder().build().err().unwrap();
        assert!(err.to_string().contains("needs a Kubernetes client"));
    }

    #[test]
    fn error_policy_requeues() {
        let action = error_policy(
            Arc::new(cluster(3, 0)),
            &Error::internal("boom"),
            Arc::new(
                Context::test_builder()
                    .kube_client(Arc::new(MockKubeClient::new()))
                    .status_store(Arc::new(MemoryStatusStore::new(cluster(3, 0))))
                    .child_store(Arc::new(FakeChildStore::default()))
                    .connector(Arc::new(MockConnector::new()))
                    .credentials(Arc::new(MockCredentialsProvider::new()))
                    .restarter(Arc::new(MockMemberRestarter::new()))
                    .build()
                    .unwrap(),
            ),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }
}
