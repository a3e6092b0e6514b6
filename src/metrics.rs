//! Prometheus metrics collection for towerd.
//!
//! Provides observability via Prometheus metrics exposed on the HTTP
//! `/metrics` endpoint. Tracks ingest volume, decisions by action,
//! callback delivery outcomes, and the active ban count.

use crate::limiter::Action;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for all metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total request events ingested.
    // Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref REQUESTS_LOGGED: IntCounter = IntCounter::new(
        "tower_requests_logged_total",
        "Request events ingested"
    ).expect("REQUESTS_LOGGED metric creation failed");

    /// Decisions returned by the engine, labeled by action.
    // Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref DECISIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("tower_decisions_total", "Decisions returned by action"),
        &["action"]
    ).expect("DECISIONS metric creation failed");

    /// Callback delivery attempts, labeled by outcome.
    // Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref CALLBACK_DELIVERIES: IntCounterVec = IntCounterVec::new(
        Opts::new("tower_callback_deliveries_total", "Callback delivery attempts by outcome"),
        &["outcome"]
    ).expect("CALLBACK_DELIVERIES metric creation failed");

    /// Currently banned IPs as seen by the in-memory mirror.
    // Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref ACTIVE_BANS: IntGauge = IntGauge::new(
        "tower_active_bans",
        "Currently banned IPs"
    ).expect("ACTIVE_BANS metric creation failed");
}

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before any metrics are recorded.
pub fn init() {
    if let Err(e) = REGISTRY.register(Box::new(REQUESTS_LOGGED.clone())) {
        tracing::warn!(error = %e, "Failed to register metric tower_requests_logged_total");
    }
    if let Err(e) = REGISTRY.register(Box::new(DECISIONS.clone())) {
        tracing::warn!(error = %e, "Failed to register metric tower_decisions_total");
    }
    if let Err(e) = REGISTRY.register(Box::new(CALLBACK_DELIVERIES.clone())) {
        tracing::warn!(error = %e, "Failed to register metric tower_callback_deliveries_total");
    }
    if let Err(e) = REGISTRY.register(Box::new(ACTIVE_BANS.clone())) {
        tracing::warn!(error = %e, "Failed to register metric tower_active_bans");
    }
}

/// Gather all metrics and encode them in Prometheus text format.
///
/// Returns a string suitable for HTTP response on `/metrics` endpoint.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

/// Count one ingested request event.
pub fn record_request_logged() {
    REQUESTS_LOGGED.inc();
}

/// Count one engine decision.
pub fn record_decision(action: Action) {
    DECISIONS.with_label_values(&[action.as_str()]).inc();
}

/// Count one callback delivery attempt.
pub fn record_callback(outcome: &str) {
    CALLBACK_DELIVERIES.with_label_values(&[outcome]).inc();
}

/// Update the active ban gauge from the mirror size.
pub fn set_active_bans(count: usize) {
    ACTIVE_BANS.set(count as i64);
}
