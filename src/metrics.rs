//! Prometheus metrics
//!
//! Counters and gauges for the operation queue and the agent binding.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Counter: operations by kind and status (rejected, succeeded, failed)
    pub static ref OPERATIONS: CounterVec = register_counter_vec!(
        "gitopsd_operations_total",
        "Operations by kind and final status",
        &["kind", "status"]
    )
    .expect("Failed to create operations metric");

    /// Histogram: operation run time (seconds)
    pub static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "gitopsd_operation_duration_seconds",
        "Duration of clone/fetch operations",
        &["kind"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to create operation_duration metric");

    /// Gauge: pending operations per repository
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "gitopsd_queue_depth",
        "Pending operations per repository",
        &["repository"]
    )
    .expect("Failed to create queue_depth metric");

    /// Gauge: known repository contexts
    pub static ref CONTEXTS: Gauge = register_gauge!(
        "gitopsd_contexts",
        "Number of repository operation contexts"
    )
    .expect("Failed to create contexts metric");

    /// Gauge: agent binding (1 = bound, 0 = not bound)
    pub static ref AGENT_BOUND: Gauge = register_gauge!(
        "gitopsd_agent_bound",
        "SSH agent binding status (1 = bound, 0 = not bound)"
    )
    .expect("Failed to create agent_bound metric");
}

/// Record an operation reaching a final status
pub fn record_operation(kind: &str, status: &str) {
    OPERATIONS.with_label_values(&[kind, status]).inc();
}

/// Record how long an operation ran
pub fn record_duration(kind: &str, duration_secs: f64) {
    OPERATION_DURATION
        .with_label_values(&[kind])
        .observe(duration_secs);
}

/// Set pending operation count for a repository
pub fn set_queue_depth(repository: &str, depth: usize) {
    QUEUE_DEPTH
        .with_label_values(&[repository])
        .set(depth as f64);
}

/// Set the number of known contexts
pub fn set_contexts(count: usize) {
    CONTEXTS.set(count as f64);
}

/// Set agent binding status
pub fn set_agent_bound(bound: bool) {
    AGENT_BOUND.set(if bound { 1.0 } else { 0.0 });
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::GitOpsError::Other(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::GitOpsError::Other(format!("Metrics are not UTF-8: {}", e)))
}
