//! Metrics sink consumed by the engine.
//!
//! The engine records counters and gauges through this trait; the hosting
//! process decides where they go (Prometheus registry, logs, nothing).

use std::collections::HashMap;

/// Label map attached to a metric sample.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Destination for engine metrics.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by `value`.
    fn counter(&self, name: &str, value: u64, labels: Labels<'_>);

    /// Set a gauge to `value`.
    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>);

    /// Record a histogram observation.
    fn histogram(&self, name: &str, value: f64, labels: Labels<'_>);
}

/// Sink that discards everything. The default when the host wires nothing up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _value: u64, _labels: Labels<'_>) {}
    fn gauge(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
    fn histogram(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
}

/// In-memory sink for tests: remembers the last value per metric name.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: std::sync::Mutex<HashMap<String, u64>>,
    gauges: std::sync::Mutex<HashMap<String, f64>>,
}

impl MemoryMetrics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, or zero.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .expect("metrics poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Last recorded gauge value.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges
            .lock()
            .expect("metrics poisoned")
            .get(name)
            .copied()
    }
}

impl MetricsSink for MemoryMetrics {
    fn counter(&self, name: &str, value: u64, _labels: Labels<'_>) {
        *self
            .counters
            .lock()
            .expect("metrics poisoned")
            .entry(name.to_string())
            .or_insert(0) += value;
    }

    fn gauge(&self, name: &str, value: f64, _labels: Labels<'_>) {
        self.gauges
            .lock()
            .expect("metrics poisoned")
            .insert(name.to_string(), value);
    }

    fn histogram(&self, name: &str, value: f64, _labels: Labels<'_>) {
        // Tests only need the latest observation
        self.gauges
            .lock()
            .expect("metrics poisoned")
            .insert(name.to_string(), value);
    }
}
