//! Per-cluster circuit breaker for protocol calls
//!
//! Shared between the reconcile path and the periodic health refresher, so
//! each breaker sits behind a mutex. After `failure_threshold` consecutive
//! failures the breaker opens and calls fail fast with `CircuitOpen`. Once
//! `open_duration` has passed exactly one call is let through as a half-open
//! trial while concurrent callers keep failing fast: success closes the
//! breaker, failure re-opens it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use neo4j_common::error::ProtocolErrorKind;
use neo4j_common::Error;

use neo4j_common::crd::{DatabaseDiagnostic, ServerDiagnostic};

use super::{Connector, Endpoint, ProtocolClient, Rows};
use crate::credentials::Credentials;

/// Breaker tuning
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before a trial call is allowed
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast
    Open,
    /// A single trial call is in flight
    HalfOpen,
}

/// Failure-counting breaker for one cluster
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failures: 0,
            last_failure: None,
            trial_started: None,
        }
    }

    /// Current state
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Consecutive failures counted so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether a call may proceed at `now`
    ///
    /// An open breaker whose cool-down has elapsed moves to half-open and
    /// admits one trial call. While that trial is outstanding every other
    /// call is refused. A trial that never reports back (its future was
    /// dropped) is replaced after another `open_duration`.
    pub fn allow(&mut self, now: Instant) -> bool {
        let open_duration = self.config.open_duration;
        let elapsed = |since: Option<Instant>| {
            since
                .map(|t| now.saturating_duration_since(t) >= open_duration)
                .unwrap_or(true)
        };
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen if !elapsed(self.trial_started) => false,
            BreakerState::Open if !elapsed(self.last_failure) => false,
            BreakerState::HalfOpen | BreakerState::Open => {
                self.state = BreakerState::HalfOpen;
                self.trial_started = Some(now);
                true
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failures = 0;
        self.trial_started = None;
    }

    /// Record a failed call at `now`
    pub fn record_failure(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);
        self.trial_started = None;
        if self.state == BreakerState::HalfOpen || self.failures >= self.config.failure_threshold
        {
            self.state = BreakerState::Open;
        }
    }
}

/// Breakers keyed by cluster
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers use `config`
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for a cluster, created closed on first use
    pub fn breaker(&self, cluster: &str) -> Arc<Mutex<CircuitBreaker>> {
        self.breakers
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.config))))
            .clone()
    }

    /// Current state of a cluster's breaker, if one exists
    pub fn state(&self, cluster: &str) -> Option<BreakerState> {
        self.breakers.get(cluster).map(|b| b.lock().state())
    }

    /// Clusters that currently have a breaker
    pub fn clusters(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop the breaker of a deleted cluster
    pub fn forget(&self, cluster: &str) {
        self.breakers.remove(cluster);
    }

    /// Open a session through the cluster's breaker
    ///
    /// The connect attempt itself counts as a call: it fails fast while the
    /// breaker is open and its failure is recorded like any other.
    pub async fn connect(
        &self,
        connector: &dyn Connector,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<GuardedClient, Error> {
        let breaker = self.breaker(&endpoint.cluster);
        let allowed = breaker.lock().allow(Instant::now());
        if !allowed {
            return Err(endpoint.error(
                ProtocolErrorKind::CircuitOpen,
                "circuit breaker open, skipping connect",
            ));
        }

        let result = connector.connect(endpoint, credentials).await;
        record_outcome(&breaker, &endpoint.cluster, result.as_ref().map(|_| ()));
        result.map(|inner| self.guard(&endpoint.cluster, inner))
    }

    /// Wrap a session so its calls go through the cluster's breaker
    pub fn guard(&self, cluster: &str, inner: Arc<dyn ProtocolClient>) -> GuardedClient {
        GuardedClient {
            cluster: cluster.to_string(),
            breaker: self.breaker(cluster),
            inner,
        }
    }
}

fn record_outcome(breaker: &Mutex<CircuitBreaker>, cluster: &str, outcome: Result<(), &Error>) {
    let mut breaker = breaker.lock();
    match outcome {
        Ok(()) => {
            if breaker.state() != BreakerState::Closed {
                info!(cluster = %cluster, "circuit breaker closed");
            }
            breaker.record_success();
        }
        Err(e) if trips_breaker(e) => {
            let was_open = breaker.state() == BreakerState::Open;
            breaker.record_failure(Instant::now());
            if !was_open && breaker.state() == BreakerState::Open {
                warn!(
                    cluster = %cluster,
                    failures = breaker.failures(),
                    error = %e,
                    "circuit breaker opened"
                );
            }
        }
        // The endpoint answered, so a half-open trial has succeeded
        Err(_) => {
            if breaker.state() == BreakerState::HalfOpen {
                info!(cluster = %cluster, "circuit breaker closed");
                breaker.record_success();
            }
        }
    }
}

/// A session whose calls are gated by a circuit breaker
pub struct GuardedClient {
    cluster: String,
    breaker: Arc<Mutex<CircuitBreaker>>,
    inner: Arc<dyn ProtocolClient>,
}

/// Whether a failure says something about the endpoint's availability
fn trips_breaker(error: &Error) -> bool {
    match error {
        Error::Protocol { kind, .. } => {
            !matches!(kind, ProtocolErrorKind::Query | ProtocolErrorKind::CircuitOpen)
        }
        _ => false,
    }
}

impl GuardedClient {
    fn admit(&self) -> Result<(), Error> {
        let allowed = self.breaker.lock().allow(Instant::now());
        if allowed {
            Ok(())
        } else {
            Err(Error::protocol(
                &self.cluster,
                ProtocolErrorKind::CircuitOpen,
                "circuit breaker open, skipping call",
            ))
        }
    }

    fn record<T>(&self, result: &Result<T, Error>) {
        record_outcome(&self.breaker, &self.cluster, result.as_ref().map(|_| ()));
    }
}

// Every call is forwarded to the same method of the inner session so that
// sessions with their own typed helpers keep them.
#[async_trait]
impl ProtocolClient for GuardedClient {
    async fn query(&self, statement: &str) -> Result<Rows, Error> {
        self.admit()?;
        let result = self.inner.query(statement).await;
        self.record(&result);
        result
    }

    async fn verify_connectivity(&self) -> Result<(), Error> {
        self.admit()?;
        let result = self.inner.verify_connectivity().await;
        self.record(&result);
        result
    }

    async fn list_servers(&self) -> Result<Vec<ServerDiagnostic>, Error> {
        self.admit()?;
        let result = self.inner.list_servers().await;
        self.record(&result);
        result
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseDiagnostic>, Error> {
        self.admit()?;
        let result = self.inner.list_databases().await;
        self.record(&result);
        result
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
