//! Prometheus metrics for the market data service
//!
//! HTTP request metrics, active stream gauges, and the process-wide registry
//! that other components (such as client managers) register into.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// --- HTTP Metrics ---

/// Total HTTP requests, labeled by service, method, path, and status code.
pub static HTTP_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["service", "method", "path", "status"],
    )
    .expect("failed to create http_requests_total")
});

/// HTTP request duration in seconds, labeled by service, method and path.
pub static HTTP_REQUEST_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new("http_request_duration_seconds", "HTTP request duration in seconds")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["service", "method", "path"],
    )
    .expect("failed to create http_request_duration_seconds")
});

/// Number of in-flight HTTP requests.
pub static HTTP_REQUESTS_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .expect("failed to create http_requests_in_flight")
});

// --- Streaming Metrics ---

/// Active server streams, labeled by RPC method.
pub static STREAMS_ACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("streams_active", "Number of active server streams"),
        &["method"],
    )
    .expect("failed to create streams_active")
});

/// Register all metrics with the registry.
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("failed to register http_requests_total");
    registry
        .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
        .expect("failed to register http_request_duration_seconds");
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .expect("failed to register http_requests_in_flight");
    registry
        .register(Box::new(STREAMS_ACTIVE.clone()))
        .expect("failed to register streams_active");
}

/// Process-wide registry, for components that bring their own collectors
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&REGISTRY.gather())
}

/// Normalize a request path for metric labels.
///
/// Connect routes are kept as-is (one per RPC); anything else outside the
/// known routes collapses to a single label to bound cardinality.
pub fn normalize_path(path: &str) -> String {
    const KNOWN: [&str; 3] = ["/api/v1/health", "/api/v1/ready", "/metrics"];

    if KNOWN.contains(&path) || path.starts_with(&format!("/{}/", marketsim_proto::MARKET_DATA_SERVICE)) {
        path.to_string()
    } else {
        "other".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/v1/health"), "/api/v1/health");
        assert_eq!(
            normalize_path("/marketsim.marketdata.v1.MarketDataService/GetPrice"),
            "/marketsim.marketdata.v1.MarketDataService/GetPrice"
        );
        assert_eq!(normalize_path("/wp-admin/login.php"), "other");
    }

    #[test]
    fn test_gather_includes_stream_gauge() {
        STREAMS_ACTIVE.with_label_values(&["stream_prices"]).inc();
        let text = gather_metrics().unwrap();
        assert!(text.contains("streams_active"));
        STREAMS_ACTIVE.with_label_values(&["stream_prices"]).dec();
    }
}
