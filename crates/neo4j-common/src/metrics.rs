//! Metrics registry for operator observability
//!
//! Provides OpenTelemetry metrics for:
//! - Cluster reconciliation (duration, errors)
//! - Per-server health as reported by `SHOW SERVERS`
//!
//! The registry is constructed once at startup and handed to every component
//! that records metrics. Instruments are created on first use and cached by
//! name, so registering the same instrument twice returns the existing one.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

/// Name of the per-server health gauge
pub const SERVER_HEALTH_GAUGE: &str = "neo4j_server_health";
/// Name of the reconcile duration histogram
pub const RECONCILE_DURATION: &str = "neo4j_cluster_reconcile_duration_seconds";
/// Name of the reconcile error counter
pub const RECONCILE_ERRORS: &str = "neo4j_cluster_reconcile_errors_total";

/// Identity of one server-health series
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerSeries {
    /// Cluster resource name
    pub cluster: String,
    /// Cluster resource namespace
    pub namespace: String,
    /// Server id
    pub server_name: String,
    /// Server address
    pub server_address: String,
}

impl ServerSeries {
    fn labels(&self) -> [KeyValue; 4] {
        [
            KeyValue::new("cluster", self.cluster.clone()),
            KeyValue::new("namespace", self.namespace.clone()),
            KeyValue::new("server_name", self.server_name.clone()),
            KeyValue::new("server_address", self.server_address.clone()),
        ]
    }
}

/// Process-wide metrics registry
///
/// Cheap to clone; clones share instruments.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    meter: Meter,
    f64_gauges: DashMap<&'static str, Gauge<f64>>,
    f64_histograms: DashMap<&'static str, Histogram<f64>>,
    u64_counters: DashMap<&'static str, Counter<u64>>,
    server_health: DashMap<ServerSeries, f64>,
}

impl MetricsRegistry {
    /// Create a registry backed by the global meter provider
    pub fn new() -> Self {
        Self::with_meter(global::meter("neo4j-operator"))
    }

    /// Create a registry backed by the given meter
    pub fn with_meter(meter: Meter) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                meter,
                f64_gauges: DashMap::new(),
                f64_histograms: DashMap::new(),
                u64_counters: DashMap::new(),
                server_health: DashMap::new(),
            }),
        }
    }

    /// Get or register an f64 gauge
    pub fn gauge(&self, name: &'static str, description: &'static str) -> Gauge<f64> {
        self.inner
            .f64_gauges
            .entry(name)
            .or_insert_with(|| {
                self.inner
                    .meter
                    .f64_gauge(name)
                    .with_description(description)
                    .build()
            })
            .clone()
    }

    /// Get or register an f64 histogram
    pub fn histogram(&self, name: &'static str, description: &'static str) -> Histogram<f64> {
        self.inner
            .f64_histograms
            .entry(name)
            .or_insert_with(|| {
                self.inner
                    .meter
                    .f64_histogram(name)
                    .with_description(description)
                    .with_unit("s")
                    .build()
            })
            .clone()
    }

    /// Get or register a u64 counter
    pub fn counter(&self, name: &'static str, description: &'static str) -> Counter<u64> {
        self.inner
            .u64_counters
            .entry(name)
            .or_insert_with(|| {
                self.inner
                    .meter
                    .u64_counter(name)
                    .with_description(description)
                    .build()
            })
            .clone()
    }

    /// Number of distinct instruments registered
    pub fn instrument_count(&self) -> usize {
        self.inner.f64_gauges.len()
            + self.inner.f64_histograms.len()
            + self.inner.u64_counters.len()
    }

    /// Record one server health sample (1.0 healthy, 0.0 otherwise)
    pub fn record_server_health(&self, series: ServerSeries, healthy: bool) {
        let value = if healthy { 1.0 } else { 0.0 };
        self.gauge(
            SERVER_HEALTH_GAUGE,
            "Server health from SHOW SERVERS (1 = Enabled and Available)",
        )
        .record(value, &series.labels());
        self.inner.server_health.insert(series, value);
    }

    /// Last recorded health value for a server series
    pub fn server_health(&self, series: &ServerSeries) -> Option<f64> {
        self.inner.server_health.get(series).map(|v| *v)
    }

    /// All server-health series recorded for one cluster
    pub fn server_health_for_cluster(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Vec<(ServerSeries, f64)> {
        let mut series: Vec<_> = self
            .inner
            .server_health
            .iter()
            .filter(|e| e.key().namespace == namespace && e.key().cluster == cluster)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        series.sort_by(|a, b| a.0.cmp(&b.0));
        series
    }

    /// Drop a cluster's server series that are not in `current`
    ///
    /// Returns how many series were removed.
    pub fn retain_servers(
        &self,
        namespace: &str,
        cluster: &str,
        current: &[ServerSeries],
    ) -> usize {
        let before = self.inner.server_health.len();
        self.inner.server_health.retain(|series, _| {
            series.namespace != namespace || series.cluster != cluster || current.contains(series)
        });
        before.saturating_sub(self.inner.server_health.len())
    }

    /// Drop every server series of a deleted cluster
    ///
    /// Returns how many series were removed.
    pub fn forget_cluster(&self, namespace: &str, cluster: &str) -> usize {
        self.retain_servers(namespace, cluster, &[])
    }

    /// `(namespace, cluster)` pairs that have server-health series
    pub fn clusters_with_server_health(&self) -> Vec<(String, String)> {
        let mut clusters: Vec<_> = self
            .inner
            .server_health
            .iter()
            .map(|e| (e.key().namespace.clone(), e.key().cluster.clone()))
            .collect();
        clusters.sort();
        clusters.dedup();
        clusters
    }

    /// Number of server-health series currently held
    pub fn server_series_count(&self) -> usize {
        self.inner.server_health.len()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Record a cluster reconciliation with timing
pub struct ReconcileTimer {
    registry: MetricsRegistry,
    cluster: String,
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(registry: &MetricsRegistry, cluster: impl Into<String>) -> Self {
        Self {
            registry: registry.clone(),
            cluster: cluster.into(),
            start: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.registry
            .histogram(RECONCILE_DURATION, "Duration of cluster reconciliation")
            .record(
                duration,
                &[
                    KeyValue::new("cluster", self.cluster),
                    KeyValue::new("result", "success"),
                ],
            );
    }

    /// Record error completion
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        self.registry
            .histogram(RECONCILE_DURATION, "Duration of cluster reconciliation")
            .record(
                duration,
                &[
                    KeyValue::new("cluster", self.cluster.clone()),
                    KeyValue::new("result", "error"),
                ],
            );
        self.registry
            .counter(RECONCILE_ERRORS, "Total number of cluster reconciliation errors")
            .add(
                1,
                &[
                    KeyValue::new("cluster", self.cluster),
                    KeyValue::new("error_type", error_type.to_string()),
                ],
            );
    }
}
