//! Per-RPC metrics.
//!
//! Two sinks fed from the same call sites:
//!
//! 1. A Prometheus registry (counters + latency histograms per method)
//!    served from an optional `/metrics` HTTP listener.
//! 2. One structured metric event per RPC (method, request id, latency
//!    breakdown, outcome) for log-based analysis. These can be switched
//!    off at runtime - the toggle is a process-wide atomic, flipped once
//!    at startup by `--disable-metrics`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use axum::{http::StatusCode, response::IntoResponse, response::Response, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static INIT: Once = Once::new();
static METRIC_EVENTS_ENABLED: AtomicBool = AtomicBool::new(true);

lazy_static! {
    /// Global Prometheus metrics registry.
    pub static ref REGISTRY: Registry = Registry::new();

    /// RPCs served, by method and outcome.
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("promptcache_requests_total", "Total RPCs served"),
        &["method", "outcome"]
    ).expect("metric can be created");

    /// Wall time spent inside the storage engine per RPC.
    pub static ref STORAGE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "promptcache_storage_latency_seconds",
            "Storage engine latency in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["method"]
    ).expect("metric can be created");

    /// End-to-end RPC latency.
    pub static ref TOTAL_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "promptcache_total_latency_seconds",
            "End-to-end RPC latency in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["method"]
    ).expect("metric can be created");

    /// Non-storage overhead per RPC.
    pub static ref OVERHEAD: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "promptcache_overhead_seconds",
            "RPC overhead (total minus storage) in seconds"
        )
        .buckets(vec![0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.05, 0.1]),
        &["method"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry. Idempotent.
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(REQUESTS_TOTAL.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(STORAGE_LATENCY.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(TOTAL_LATENCY.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(OVERHEAD.clone()))
            .expect("collector can be registered");
    });
}

/// Enable or disable per-RPC metric events.
pub fn set_metric_events(enabled: bool) {
    METRIC_EVENTS_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Record one completed RPC into both sinks.
pub fn record_rpc(
    method: &str,
    request_id: &str,
    storage_latency_us: i64,
    total_latency_us: i64,
    success: bool,
    error: &str,
) {
    let outcome = if success { "ok" } else { "error" };
    REQUESTS_TOTAL.with_label_values(&[method, outcome]).inc();
    STORAGE_LATENCY
        .with_label_values(&[method])
        .observe(storage_latency_us as f64 / 1e6);
    TOTAL_LATENCY
        .with_label_values(&[method])
        .observe(total_latency_us as f64 / 1e6);
    OVERHEAD
        .with_label_values(&[method])
        .observe((total_latency_us - storage_latency_us).max(0) as f64 / 1e6);

    if METRIC_EVENTS_ENABLED.load(Ordering::Relaxed) {
        tracing::info!(
            target: "metrics",
            method,
            request_id,
            storage_latency_us,
            total_latency_us,
            overhead_us = total_latency_us - storage_latency_us,
            success,
            error,
            "rpc"
        );
    }
}

/// Handler for the Prometheus scrape endpoint.
async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Router exposing `/metrics`.
pub fn create_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_rpc_populates_registry() {
        init();
        record_rpc("Lookup", "req-1", 1200, 1500, true, "");
        record_rpc("Lookup", "req-2", 0, 300, false, "boom");

        let families = REGISTRY.gather();
        let requests = families
            .iter()
            .find(|f| f.get_name() == "promptcache_requests_total")
            .expect("requests metric present");
        let total: u64 = requests
            .get_metric()
            .iter()
            .map(|m| m.get_counter().get_value() as u64)
            .sum();
        assert!(total >= 2);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        init();
        let response = metrics_handler().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
