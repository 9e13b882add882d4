//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    AUTO_SETUP_TOTAL, CIRCUIT_OPEN, CIRCUIT_TRANSITIONS_TOTAL, FAILOVER_FALLBACKS_TOTAL,
    FAILOVER_POLL_ERRORS_TOTAL, MESSAGES_ACKED_TOTAL, MESSAGES_DROPPED_TOTAL,
    MESSAGES_RECEIVED_TOTAL, MESSAGES_RECLAIMED_TOTAL, MESSAGES_REJECTED_TOTAL,
    MESSAGES_SENT_TOTAL, OPERATION_LATENCY, RETRIES_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording per-backend message metrics
pub struct EngineMetrics;

impl EngineMetrics {
    pub fn record_sent(backend: &str) {
        MESSAGES_SENT_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_received(backend: &str) {
        MESSAGES_RECEIVED_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_acked(backend: &str) {
        MESSAGES_ACKED_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_rejected(backend: &str) {
        MESSAGES_REJECTED_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_reclaimed(backend: &str, count: u64) {
        if count > 0 {
            MESSAGES_RECLAIMED_TOTAL.with_label_values(&[backend]).inc_by(count);
        }
    }

    pub fn record_dropped(backend: &str, count: u64) {
        if count > 0 {
            MESSAGES_DROPPED_TOTAL.with_label_values(&[backend]).inc_by(count);
        }
    }

    pub fn record_auto_setup(backend: &str) {
        AUTO_SETUP_TOTAL.with_label_values(&[backend]).inc();
    }
}

/// Helper struct for recording retry metrics
pub struct RetryMetrics;

impl RetryMetrics {
    pub fn record_retry(operation: &str) {
        RETRIES_TOTAL.with_label_values(&[operation]).inc();
    }
}

/// Helper struct for recording failover metrics
pub struct FailoverMetrics;

impl FailoverMetrics {
    pub fn record_fallback(transport: &str) {
        FAILOVER_FALLBACKS_TOTAL.with_label_values(&[transport]).inc();
    }

    pub fn record_poll_error(transport: &str) {
        FAILOVER_POLL_ERRORS_TOTAL.with_label_values(&[transport]).inc();
    }

    /// Record a circuit state change (`"open"`, `"half_open"`, `"closed"`)
    pub fn record_transition(transport: &str, backend: &str, state: &str) {
        CIRCUIT_TRANSITIONS_TOTAL
            .with_label_values(&[transport, backend, state])
            .inc();
        CIRCUIT_OPEN
            .with_label_values(&[transport, backend])
            .set(if state == "open" { 1 } else { 0 });
    }

    pub fn observe_latency(transport: &str, operation: &str, latency: Duration) {
        OPERATION_LATENCY
            .with_label_values(&[transport, operation])
            .observe(latency.as_secs_f64());
    }
}
