//! Resource convergence engine
//!
//! Diffs desired child objects against live ones by content hash and applies
//! only what changed. The hash of the last applied desired object is stored
//! in the `neo4j.neo4j.com/content-hash` annotation, so an unchanged spec
//! issues zero writes no matter how often it is reconciled.
//!
//! ConfigMap changes are debounced: a change is applied only after it has
//! been stable for the quiet window. The StatefulSet pod template carries
//! the hash of the configuration that is actually applied, so the servers
//! restart once per settled change instead of once per edit.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use neo4j_common::crd::ChildNames;
use neo4j_common::kube_utils::{
    content_hash, recorded_hash, set_annotation, CONFIG_HASH_ANNOTATION, CONTENT_HASH_ANNOTATION,
    FIELD_MANAGER, RESTART_GENERATION_ANNOTATION,
};
use neo4j_common::Error;

use crate::topology::ScaleTransition;

/// Default quiet window for configuration changes
pub const DEFAULT_CONFIG_DEBOUNCE: Duration = Duration::from_secs(120);

/// Kind of a child object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    /// ConfigMap
    ConfigMap,
    /// Service
    Service,
    /// StatefulSet
    StatefulSet,
}

/// Identity of a child object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildKey {
    /// Object kind
    pub kind: ChildKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ChildKey {
    /// Keys of every object owned by the cluster `cluster` in `namespace`
    pub fn owned_by(namespace: &str, cluster: &str) -> Vec<ChildKey> {
        let names = ChildNames::for_cluster(cluster);
        [
            (ChildKind::ConfigMap, names.config_map),
            (ChildKind::Service, names.headless_service),
            (ChildKind::Service, names.client_service),
            (ChildKind::StatefulSet, names.server_set),
        ]
        .into_iter()
        .map(|(kind, name)| ChildKey {
            kind,
            namespace: namespace.to_string(),
            name,
        })
        .collect()
    }
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A child object owned by a cluster
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChildObject {
    /// Server configuration
    ConfigMap(ConfigMap),
    /// Client or headless Service
    Service(Service),
    /// The servers
    StatefulSet(StatefulSet),
}

impl ChildObject {
    /// Object kind
    pub fn kind(&self) -> ChildKind {
        match self {
            Self::ConfigMap(_) => ChildKind::ConfigMap,
            Self::Service(_) => ChildKind::Service,
            Self::StatefulSet(_) => ChildKind::StatefulSet,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::ConfigMap(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
            Self::StatefulSet(o) => &o.metadata,
        }
    }

    /// Mutable object metadata
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::ConfigMap(o) => &mut o.metadata,
            Self::Service(o) => &mut o.metadata,
            Self::StatefulSet(o) => &mut o.metadata,
        }
    }

    /// Object identity
    pub fn key(&self) -> ChildKey {
        let meta = self.meta();
        ChildKey {
            kind: self.kind(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// Hash of the semantically relevant content
    pub fn content_hash(&self) -> Result<String, Error> {
        match self {
            Self::ConfigMap(o) => content_hash(o),
            Self::Service(o) => content_hash(o),
            Self::StatefulSet(o) => content_hash(o),
        }
    }
}

/// Reads and writes child objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChildStore: Send + Sync {
    /// Live object, if it exists
    async fn get(&self, key: &ChildKey) -> Result<Option<ChildObject>, Error>;

    /// Create or update an object with server-side apply
    async fn apply(&self, object: &ChildObject) -> Result<(), Error>;
}

/// [`ChildStore`] backed by the Kubernetes API
pub struct KubeChildStore {
    client: Client,
}

impl KubeChildStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChildStore for KubeChildStore {
    async fn get(&self, key: &ChildKey) -> Result<Option<ChildObject>, Error> {
        let client = self.client.clone();
        let ns = &key.namespace;
        Ok(match key.kind {
            ChildKind::ConfigMap => Api::<ConfigMap>::namespaced(client, ns)
                .get_opt(&key.name)
                .await?
                .map(ChildObject::ConfigMap),
            ChildKind::Service => Api::<Service>::namespaced(client, ns)
                .get_opt(&key.name)
                .await?
                .map(ChildObject::Service),
            ChildKind::StatefulSet => Api::<StatefulSet>::namespaced(client, ns)
                .get_opt(&key.name)
                .await?
                .map(ChildObject::StatefulSet),
        })
    }

    async fn apply(&self, object: &ChildObject) -> Result<(), Error> {
        let key = object.key();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let client = self.client.clone();
        match object {
            ChildObject::ConfigMap(o) => {
                Api::<ConfigMap>::namespaced(client, &key.namespace)
                    .patch(&key.name, &params, &Patch::Apply(o))
                    .await?;
            }
            ChildObject::Service(o) => {
                Api::<Service>::namespaced(client, &key.namespace)
                    .patch(&key.name, &params, &Patch::Apply(o))
                    .await?;
            }
            ChildObject::StatefulSet(o) => {
                Api::<StatefulSet>::namespaced(client, &key.namespace)
                    .patch(&key.name, &params, &Patch::Apply(o))
                    .await?;
            }
        }
        Ok(())
    }
}

/// What the debounce tracker decided for a changed object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebounceDecision {
    /// Desired content equals live content; nothing to do
    InSync,
    /// The change has been stable for the whole window; apply it
    Apply,
    /// Still inside the window; check again after the given delay
    Wait(Duration),
}

#[derive(Debug)]
struct PendingChange {
    hash: String,
    since: Instant,
}

/// Tracks configuration changes waiting out their quiet window
///
/// Shared across reconciles; in-memory only, so a restarted operator waits
/// one full window before applying a change it had already been holding.
#[derive(Debug)]
pub struct DebounceTracker {
    window: Duration,
    pending: Mutex<HashMap<ChildKey, PendingChange>>,
}

impl Default for DebounceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_DEBOUNCE)
    }
}

impl DebounceTracker {
    /// Create a tracker with the given quiet window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Quiet window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide what to do with an object whose desired hash is `desired`
    pub fn observe(
        &self,
        key: &ChildKey,
        desired: &str,
        live: Option<&str>,
        now: Instant,
    ) -> DebounceDecision {
        let mut pending = self.pending.lock();
        if live == Some(desired) {
            // Reverted or already applied
            if pending.remove(key).is_some() {
                debug!(object = %key, "discarding configuration change that reverted");
            }
            return DebounceDecision::InSync;
        }

        if let Some(change) = pending.get(key) {
            if change.hash == desired {
                let stable_for = now.saturating_duration_since(change.since);
                if stable_for >= self.window {
                    pending.remove(key);
                    return DebounceDecision::Apply;
                }
                return DebounceDecision::Wait(self.window - stable_for);
            }
        }

        if self.window.is_zero() {
            pending.remove(key);
            return DebounceDecision::Apply;
        }
        pending.insert(
            key.clone(),
            PendingChange {
                hash: desired.to_string(),
                since: now,
            },
        );
        DebounceDecision::Wait(self.window)
    }

    /// Drop any pending change for an object
    pub fn clear(&self, key: &ChildKey) {
        self.pending.lock().remove(key);
    }

    /// Drop the pending changes of exactly these objects
    pub fn forget(&self, keys: &[ChildKey]) {
        let mut pending = self.pending.lock();
        for key in keys {
            pending.remove(key);
        }
    }

    /// Number of changes currently held back
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// What one convergence pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Objects written
    pub applied: Vec<ChildKey>,
    /// Objects already up to date
    pub skipped: Vec<ChildKey>,
    /// Changed objects held back by the debounce window
    pub pending: Vec<ChildKey>,
    /// Earliest time a held-back change becomes due
    pub next_check: Option<Duration>,
}

impl ConvergeReport {
    fn wait(&mut self, key: ChildKey, delay: Duration) {
        self.pending.push(key);
        self.next_check = Some(self.next_check.map_or(delay, |d| d.min(delay)));
    }
}

/// Applies desired child objects
pub struct Converger<'a> {
    store: &'a dyn ChildStore,
    debounce: &'a DebounceTracker,
}

impl<'a> Converger<'a> {
    /// Create a converger over a store and shared debounce state
    pub fn new(store: &'a dyn ChildStore, debounce: &'a DebounceTracker) -> Self {
        Self { store, debounce }
    }

    /// Converge `desired` onto the live objects
    ///
    /// With [`ScaleTransition::ScaleUpSingleToMulti`] the configuration is
    /// applied without waiting and the StatefulSet pod template is stamped
    /// with `generation`, restarting the existing members.
    pub async fn converge(
        &self,
        desired: Vec<ChildObject>,
        transition: Option<ScaleTransition>,
        generation: i64,
        now: Instant,
    ) -> Result<ConvergeReport, Error> {
        let mut report = ConvergeReport::default();
        let (sets, others): (Vec<_>, Vec<_>) = desired
            .into_iter()
            .partition(|o| o.kind() == ChildKind::StatefulSet);

        let mut config_hashes = BTreeMap::new();
        for object in others {
            let key = object.key();
            let live = self.store.get(&key).await?;
            let desired_hash = object.content_hash()?;
            let live_hash = live
                .as_ref()
                .and_then(|l| recorded_hash(l.meta()))
                .map(str::to_string);

            let debounced = live.is_some()
                && object.kind() == ChildKind::ConfigMap
                && transition.is_none();

            let effective = if live.is_none() {
                self.apply(object, &desired_hash, &mut report).await?;
                desired_hash
            } else if debounced {
                match self
                    .debounce
                    .observe(&key, &desired_hash, live_hash.as_deref(), now)
                {
                    DebounceDecision::InSync => {
                        report.skipped.push(key.clone());
                        desired_hash
                    }
                    DebounceDecision::Apply => {
                        self.apply(object, &desired_hash, &mut report).await?;
                        desired_hash
                    }
                    DebounceDecision::Wait(delay) => {
                        info!(
                            object = %key,
                            delay_secs = delay.as_secs(),
                            "holding configuration change until it settles"
                        );
                        report.wait(key.clone(), delay);
                        live_hash.unwrap_or_default()
                    }
                }
            } else if live_hash.as_deref() == Some(desired_hash.as_str()) {
                report.skipped.push(key.clone());
                desired_hash
            } else {
                self.debounce.clear(&key);
                self.apply(object, &desired_hash, &mut report).await?;
                desired_hash
            };

            if key.kind == ChildKind::ConfigMap {
                config_hashes.insert(key.name, effective);
            }
        }

        let config_hash = config_hashes.into_values().collect::<Vec<_>>().join(",");
        for object in sets {
            let ChildObject::StatefulSet(mut sts) = object else {
                continue;
            };
            let key = ChildObject::StatefulSet(sts.clone()).key();
            let live = self.store.get(&key).await?;

            let restart = match transition {
                Some(ScaleTransition::ScaleUpSingleToMulti) => Some(generation.to_string()),
                None => live.as_ref().and_then(|l| match l {
                    ChildObject::StatefulSet(l) => {
                        template_annotation(l, RESTART_GENERATION_ANNOTATION)
                    }
                    _ => None,
                }),
            };
            let annotations = template_annotations_mut(&mut sts);
            if !config_hash.is_empty() {
                annotations.insert(CONFIG_HASH_ANNOTATION.to_string(), config_hash.clone());
            }
            if let Some(restart) = restart {
                annotations.insert(RESTART_GENERATION_ANNOTATION.to_string(), restart);
            }

            let object = ChildObject::StatefulSet(sts);
            let desired_hash = object.content_hash()?;
            let live_hash = live.as_ref().and_then(|l| recorded_hash(l.meta()));
            if live_hash == Some(desired_hash.as_str()) {
                report.skipped.push(key);
            } else {
                self.apply(object, &desired_hash, &mut report).await?;
            }
        }

        Ok(report)
    }

    async fn apply(
        &self,
        mut object: ChildObject,
        hash: &str,
        report: &mut ConvergeReport,
    ) -> Result<(), Error> {
        set_annotation(object.meta_mut(), CONTENT_HASH_ANNOTATION, hash);
        let key = object.key();
        self.store.apply(&object).await?;
        info!(object = %key, hash, "applied child object");
        report.applied.push(key);
        Ok(())
    }
}

fn template_annotation(sts: &StatefulSet, key: &str) -> Option<String> {
    sts.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(key)
        .cloned()
}

fn template_annotations_mut(sts: &mut StatefulSet) -> &mut BTreeMap<String, String> {
    sts.spec
        .get_or_insert_with(Default::default)
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
}
