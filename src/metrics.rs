//! Counter and gauge emission.
//!
//! Components report through a [`MetricsSink`]; every name is prefixed with
//! `database.` before it reaches the sink implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! let metrics: Arc<dyn MetricsSink> = Arc::new(InMemoryMetrics::new());
//! metrics.increment("replica.fallback", 1);
//! metrics.gauge("replica.0.lag", 12.0);
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Prefix applied to every metric name.
pub const METRIC_PREFIX: &str = "database";

/// Full metric name for a component-relative name.
pub fn metric_name(name: &str) -> String {
    format!("{METRIC_PREFIX}.{name}")
}

/// Destination for operational counters and gauges.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by the given value.
    fn increment(&self, name: &str, by: u64);

    /// Set a gauge value.
    fn gauge(&self, name: &str, value: f64);
}

/// Emits each metric as a `tracing` event on the `blogdb_ops::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &str, by: u64) {
        info!(target: "blogdb_ops::metrics", metric = %metric_name(name), kind = "counter", value = by);
    }

    fn gauge(&self, name: &str, value: f64) {
        info!(target: "blogdb_ops::metrics", metric = %metric_name(name), kind = "gauge", value);
    }
}

/// Keeps the latest counter and gauge values in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current counter value; accepts names with or without the prefix.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(&Self::qualified(name))
            .copied()
            .unwrap_or(0)
    }

    /// Last gauge value; accepts names with or without the prefix.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.read().get(&Self::qualified(name)).copied()
    }

    /// All counters, sorted by name.
    pub fn counters(&self) -> Vec<(String, u64)> {
        let mut all: Vec<_> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        all.sort();
        all
    }

    fn qualified(name: &str) -> String {
        if name.starts_with(&format!("{METRIC_PREFIX}.")) {
            name.to_string()
        } else {
            metric_name(name)
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, by: u64) {
        *self.counters.write().entry(metric_name(name)).or_insert(0) += by;
    }

    fn gauge(&self, name: &str, value: f64) {
        self.gauges.write().insert(metric_name(name), value);
    }
}
