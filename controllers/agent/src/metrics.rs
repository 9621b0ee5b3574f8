//! Prometheus metrics of the agent.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters exposed on `/metrics`.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    allocations: IntCounterVec,
    releases: IntCounterVec,
    pool_status_updates: IntCounterVec,
    cluster_pods: IntGauge,
}

impl Metrics {
    /// Creates and registers the agent metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let allocations = IntCounterVec::new(
            Opts::new("podnet_allocations_total", "Allocate requests by result"),
            &["result"],
        )?;
        let releases = IntCounterVec::new(
            Opts::new("podnet_releases_total", "Release requests by result"),
            &["result"],
        )?;
        let pool_status_updates = IntCounterVec::new(
            Opts::new("podnet_pool_status_updates_total", "IPPool status reconciliations by result"),
            &["result"],
        )?;
        let cluster_pods = IntGauge::new("podnet_cluster_pods", "Entries mirrored into cluster_pod_ips")?;

        registry.register(Box::new(allocations.clone()))?;
        registry.register(Box::new(releases.clone()))?;
        registry.register(Box::new(pool_status_updates.clone()))?;
        registry.register(Box::new(cluster_pods.clone()))?;

        Ok(Self {
            registry,
            allocations,
            releases,
            pool_status_updates,
            cluster_pods,
        })
    }

    /// Counts an Allocate call; `result` is `"success"` or an error code.
    pub fn allocation(&self, result: &str) {
        self.allocations.with_label_values(&[result]).inc();
    }

    /// Counts a Release call.
    pub fn release(&self, result: &str) {
        self.releases.with_label_values(&[result]).inc();
    }

    /// Counts a pool status reconciliation (`"updated"`, `"unchanged"`, `"dropped"`).
    pub fn pool_status(&self, result: &str) {
        self.pool_status_updates.with_label_values(&[result]).inc();
    }

    /// Records the size of the cluster pod mirror.
    pub fn set_cluster_pods(&self, count: usize) {
        self.cluster_pods.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Renders all metrics in the text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
