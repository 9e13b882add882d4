//! Prometheus metrics for queue engines and the failover layer.
//!
//! - Message metrics (sent, received, acked, rejected by backend)
//! - Redelivery metrics (reclaimed claims, ring-buffer drops)
//! - Retry and auto-setup metrics
//! - Failover metrics (fallbacks, poll errors, circuit transitions)
//! - Latency metrics per transport and operation

mod helpers;

pub use helpers::{encode_metrics, EngineMetrics, FailoverMetrics, RetryMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "queue";

lazy_static! {
    // ============================================================================
    // Message Metrics
    // ============================================================================

    /// Messages persisted by a backend
    pub static ref MESSAGES_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Messages persisted, by backend",
        &["backend"]
    ).unwrap();

    /// Messages claimed by a poll
    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Messages claimed by a poll, by backend",
        &["backend"]
    ).unwrap();

    pub static ref MESSAGES_ACKED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_acked_total", METRIC_PREFIX),
        "Messages acknowledged, by backend",
        &["backend"]
    ).unwrap();

    pub static ref MESSAGES_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_rejected_total", METRIC_PREFIX),
        "Messages rejected, by backend",
        &["backend"]
    ).unwrap();

    // ============================================================================
    // Redelivery Metrics
    // ============================================================================

    /// Abandoned claims returned to the ready list
    pub static ref MESSAGES_RECLAIMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_reclaimed_total", METRIC_PREFIX),
        "Abandoned claims made pollable again, by backend",
        &["backend"]
    ).unwrap();

    /// Oldest ready entries dropped by the ring-buffer bound
    pub static ref MESSAGES_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_dropped_total", METRIC_PREFIX),
        "Ready entries dropped to honour queue_max_entries, by backend",
        &["backend"]
    ).unwrap();

    // ============================================================================
    // Retry Metrics
    // ============================================================================

    pub static ref RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_retries_total", METRIC_PREFIX),
        "Transient failures retried, by operation",
        &["operation"]
    ).unwrap();

    pub static ref AUTO_SETUP_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_auto_setup_total", METRIC_PREFIX),
        "Structures created on demand after a missing-table error",
        &["backend"]
    ).unwrap();

    // ============================================================================
    // Failover Metrics
    // ============================================================================

    /// Failed attempts that made the sender move to the next transport
    pub static ref FAILOVER_FALLBACKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_failover_fallbacks_total", METRIC_PREFIX),
        "Send attempts that failed over to the next transport",
        &["transport"]
    ).unwrap();

    pub static ref FAILOVER_POLL_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_failover_poll_errors_total", METRIC_PREFIX),
        "Polls that failed and returned empty",
        &["transport"]
    ).unwrap();

    pub static ref CIRCUIT_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_circuit_transitions_total", METRIC_PREFIX),
        "Circuit breaker state transitions, by failover transport and backend",
        &["transport", "backend", "state"]
    ).unwrap();

    /// 1 while the circuit is open
    pub static ref CIRCUIT_OPEN: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_circuit_open", METRIC_PREFIX),
        "Whether the circuit for a backend of a failover transport is open",
        &["transport", "backend"]
    ).unwrap();

    // ============================================================================
    // Latency Metrics
    // ============================================================================

    pub static ref OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_operation_latency_seconds", METRIC_PREFIX),
        "Latency of transport operations",
        &["transport", "operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();
}
