//! Prometheus metrics for the bridge operator
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    // Poll loop metrics
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "bridge_blocks_processed_total",
        "Total number of blocks classified",
        &["chain"]
    ).unwrap();

    pub static ref WATERMARK: GaugeVec = register_gauge_vec!(
        "bridge_watermark_height",
        "Last height fully classified and dispatched",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_CLASSIFIED: CounterVec = register_counter_vec!(
        "bridge_events_classified_total",
        "Bridge events emitted by the classifier",
        &["chain", "kind"]
    ).unwrap();

    // Quorum metrics
    pub static ref SIGNATURES_COLLECTED: CounterVec = register_counter_vec!(
        "bridge_signatures_collected_total",
        "Validator signatures accepted by the quorum engine",
        &["direction"]
    ).unwrap();

    pub static ref QUORUMS_REACHED: CounterVec = register_counter_vec!(
        "bridge_quorums_reached_total",
        "Receipts that reached quorum and executed",
        &["direction"]
    ).unwrap();

    // Queue metrics
    pub static ref QUEUE_MESSAGES: CounterVec = register_counter_vec!(
        "bridge_queue_messages_total",
        "Relay queue message transitions",
        &["queue", "action"]
    ).unwrap();

    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "bridge_queue_depth",
        "Messages stored in a relay queue",
        &["queue"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "bridge_errors_total",
        "Total number of errors",
        &["component", "type"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "bridge_consecutive_failures",
        "Consecutive failed poll cycles",
        &["chain"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "bridge_operator_up",
        "Whether the operator is up and running"
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "bridge_last_successful_poll_timestamp",
        "Unix timestamp of last successful poll",
        &["chain"]
    ).unwrap();
}

/// Record a classified block range
pub fn record_blocks_processed(chain: &str, from: u64, to: u64) {
    BLOCKS_PROCESSED
        .with_label_values(&[chain])
        .inc_by((to.saturating_sub(from) + 1) as f64);
}

pub fn set_watermark(chain: &str, height: u64) {
    WATERMARK.with_label_values(&[chain]).set(height as f64);
}

pub fn record_event(chain: &str, kind: &str) {
    EVENTS_CLASSIFIED.with_label_values(&[chain, kind]).inc();
}

pub fn record_signature_collected(direction: &str) {
    SIGNATURES_COLLECTED.with_label_values(&[direction]).inc();
}

pub fn record_quorum_reached(direction: &str) {
    QUORUMS_REACHED.with_label_values(&[direction]).inc();
}

/// `action` is one of `sent`, `received`, `deleted`, `dead_lettered`, `retried`
pub fn record_queue_message(queue: &str, action: &str) {
    QUEUE_MESSAGES.with_label_values(&[queue, action]).inc();
}

pub fn set_queue_depth(queue: &str, depth: u64) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(depth as f64);
}

/// Record an error
pub fn record_error(component: &str, error_type: &str) {
    ERRORS.with_label_values(&[component, error_type]).inc();
}

pub fn set_consecutive_failures(chain: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[chain])
        .set(count as f64);
}

/// Record last successful poll
pub fn record_successful_poll(chain: &str) {
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[chain])
        .set(chrono::Utc::now().timestamp() as f64);
}
