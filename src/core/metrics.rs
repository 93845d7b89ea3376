// src/core/metrics.rs

//! Defines and registers Prometheus metrics for broker monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Gauges ---
    /// The number of clients currently connected to this broker.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("spinelchat_connected_clients", "Number of currently connected clients.").unwrap();
    /// The number of sessions that completed login and are still open.
    pub static ref LOGGED_IN_SESSIONS: Gauge =
        register_gauge!("spinelchat_logged_in_sessions", "Number of logged-in sessions.").unwrap();

    // --- Counters ---
    /// The total number of connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("spinelchat_connections_received_total", "Total number of connections received.").unwrap();
    /// Inbound frames handled, labeled by body type.
    pub static ref FRAMES_PROCESSED_TOTAL: CounterVec =
        register_counter_vec!("spinelchat_frames_processed_total", "Total number of inbound frames processed, labeled by type.", &["type"]).unwrap();
    /// Inbound frames that could not be decoded.
    pub static ref DECODE_ERRORS_TOTAL: Counter =
        register_counter!("spinelchat_decode_errors_total", "Total number of frames that failed to decode.").unwrap();
    /// Sessions closed by the heartbeat sweeper.
    pub static ref HEARTBEAT_TIMEOUTS_TOTAL: Counter =
        register_counter!("spinelchat_heartbeat_timeouts_total", "Total number of sessions closed for missing heartbeats.").unwrap();
    /// Lock acquisitions that exhausted their retries.
    pub static ref LOCK_ACQUIRE_FAILURES_TOTAL: Counter =
        register_counter!("spinelchat_lock_acquire_failures_total", "Total number of lock acquisitions that gave up.").unwrap();
    /// Deliveries, labeled by route (local, relay, dropped).
    pub static ref DELIVERIES_TOTAL: CounterVec =
        register_counter_vec!("spinelchat_deliveries_total", "Total number of deliveries, labeled by route.", &["route"]).unwrap();
    /// Keys purged by the memory store's active expiry.
    pub static ref EXPIRED_KEYS_TOTAL: Counter =
        register_counter!("spinelchat_expired_keys_total", "Total number of keys expired proactively by the memory store.").unwrap();

    // --- Histograms ---
    /// A histogram of inbound frame handling latencies.
    pub static ref FRAME_LATENCY_SECONDS: Histogram =
        register_histogram!("spinelchat_frame_latency_seconds", "Latency of frame handling in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
