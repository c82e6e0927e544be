//! Prometheus metrics for the connectivity layer.
//!
//! Covers:
//! - Stream state machine and reconnects
//! - Dispatched messages and dropped protocol errors
//! - REST outcomes, retries and rate-limit waits
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a fatal configuration error that should
//! crash at first use rather than fail silently.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

/// Stream state names, in state machine order.
const STREAM_STATES: [&str; 7] = [
    "disconnected",
    "connecting",
    "authenticating",
    "subscribing",
    "active",
    "reconnecting",
    "closed",
];

/// Stream state machine current state.
/// Labels: stream, state
pub static WS_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "xarb_ws_state",
        "Stream state machine current state (1=current, 0=other)",
        &["stream", "state"]
    )
    .unwrap()
});

/// Total stream reconnection attempts.
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "xarb_ws_reconnect_total",
        "Total stream reconnection attempts",
        &["stream", "reason"]
    )
    .unwrap()
});

/// Decoded messages by kind.
pub static WS_MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "xarb_ws_messages_total",
        "Decoded stream messages",
        &["stream", "kind"]
    )
    .unwrap()
});

/// Frames dropped because they could not be decoded.
pub static WS_PROTOCOL_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "xarb_ws_protocol_errors_total",
        "Frames dropped as protocol errors",
        &["stream"]
    )
    .unwrap()
});

/// REST request outcomes, one per logical request. Retries are counted by
/// `REST_RETRIES_TOTAL`.
pub static REST_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "xarb_rest_requests_total",
        "REST requests by final outcome after retries",
        &["endpoint", "outcome"]
    )
    .unwrap()
});

/// REST retries by error kind.
pub static REST_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "xarb_rest_retries_total",
        "REST retries scheduled",
        &["endpoint", "kind"]
    )
    .unwrap()
});

/// Time spent waiting on the rate limiter in milliseconds.
pub static REST_RATE_LIMIT_WAIT_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "xarb_rest_rate_limit_wait_ms",
        "Time spent waiting for a rate limit grant in milliseconds",
        &["endpoint"],
        vec![0.0, 1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Set stream state. Only the current state is 1, all others 0.
    pub fn ws_state_set(stream: &str, state: &str) {
        for s in STREAM_STATES {
            WS_STATE.with_label_values(&[stream, s]).set(0.0);
        }
        WS_STATE.with_label_values(&[stream, state]).set(1.0);
    }

    /// Record a reconnection attempt.
    pub fn ws_reconnect(stream: &str, reason: &str) {
        WS_RECONNECT_TOTAL
            .with_label_values(&[stream, reason])
            .inc();
    }

    /// Record a decoded message.
    pub fn ws_message(stream: &str, kind: &str) {
        WS_MESSAGES_TOTAL.with_label_values(&[stream, kind]).inc();
    }

    /// Record a dropped frame.
    pub fn ws_protocol_error(stream: &str) {
        WS_PROTOCOL_ERRORS_TOTAL.with_label_values(&[stream]).inc();
    }

    /// Record a REST attempt outcome ("ok" or an error kind).
    pub fn rest_request(endpoint: &str, outcome: &str) {
        REST_REQUESTS_TOTAL
            .with_label_values(&[endpoint, outcome])
            .inc();
    }

    /// Record a scheduled REST retry.
    pub fn rest_retry(endpoint: &str, kind: &str) {
        REST_RETRIES_TOTAL
            .with_label_values(&[endpoint, kind])
            .inc();
    }

    /// Record time spent in `RateLimiter::acquire`.
    pub fn rate_limit_wait(endpoint: &str, wait_ms: f64) {
        REST_RATE_LIMIT_WAIT_MS
            .with_label_values(&[endpoint])
            .observe(wait_ms);
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn gather_text() -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
