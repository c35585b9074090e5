//! Prometheus Metrics for Geotier
//!
//! Process-wide counters complementing the per-region `CacheStats`:
//! - Cache operations by region, operation and outcome
//! - Operation latency
//! - Maintenance results

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, TextEncoder, register_histogram_vec,
    register_int_counter_vec,
};

lazy_static! {
    /// Cache operations by region, operation and outcome (hit, miss, ok, error, declined)
    pub static ref CACHE_OPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "geotier_cache_operations_total",
        "Total number of cache operations by region, type and outcome",
        &["region", "operation", "outcome"]
    ).expect("geotier_cache_operations_total registers once");

    /// Cache operation latency in seconds
    pub static ref CACHE_OP_DURATION: HistogramVec = register_histogram_vec!(
        "geotier_cache_operation_duration_seconds",
        "Cache operation latency in seconds",
        &["operation"],
        vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]
    ).expect("geotier_cache_operation_duration_seconds registers once");

    /// Entries removed by maintenance and invalidation
    pub static ref CACHE_EVICTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "geotier_cache_evictions_total",
        "Entries removed by lazy expiration, corruption checks, invalidation and optimize",
        &["region", "reason"]
    ).expect("geotier_cache_evictions_total registers once");
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a cache operation outcome
pub fn record_cache_op(region: &str, operation: &str, outcome: &str) {
    CACHE_OPS_TOTAL
        .with_label_values(&[region, operation, outcome])
        .inc();
}

/// Record cache operation latency
pub fn observe_duration(operation: &str, duration_secs: f64) {
    CACHE_OP_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record removed entries
pub fn record_evictions(region: &str, reason: &str, count: u64) {
    if count > 0 {
        CACHE_EVICTIONS_TOTAL
            .with_label_values(&[region, reason])
            .inc_by(count);
    }
}
