//! Request accounting for the HTTP front-end

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;

use super::metrics;
use crate::http::AppState;

/// Record request count, latency and in-flight gauge, labelled with the service name
///
/// For Connect server streams the latency covers time to the response head;
/// the stream body is accounted for by the stream gauge instead.
pub async fn metrics_layer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().as_str().to_owned();
    let path = metrics::normalize_path(request.uri().path());
    let _in_flight = InFlight::enter();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let service = state.service_name.as_str();
    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[service, method.as_str(), path.as_str(), status.as_str()])
        .inc();
    metrics::HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[service, method.as_str(), path.as_str()])
        .observe(started.elapsed().as_secs_f64());

    response
}

/// One slot of the in-flight gauge, released when the request future is dropped
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::HTTP_REQUESTS_IN_FLIGHT.inc();
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::HTTP_REQUESTS_IN_FLIGHT.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{MarketDataApiImpl, MarketDataConfig};
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use marketsim_core::simulation::SimulatedPriceSource;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state(service_name: &str) -> AppState {
        AppState {
            api: Arc::new(MarketDataApiImpl::new(
                Arc::new(SimulatedPriceSource::new()),
                MarketDataConfig::default(),
            )),
            registry: None,
            service_name: service_name.to_string(),
            service_version: "0.0.0".to_string(),
            channel_capacity: 4,
        }
    }

    #[tokio::test]
    async fn test_requests_labelled_with_service() {
        let state = state("middleware-labels");
        let app = Router::new()
            .route("/api/v1/health", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(state.clone(), metrics_layer))
            .with_state(state);

        for path in ["/api/v1/health", "/api/v1/health", "/nope"] {
            let request = axum::http::Request::get(path).body(Body::empty()).unwrap();
            app.clone().oneshot(request).await.unwrap();
        }

        let ok = metrics::HTTP_REQUESTS_TOTAL
            .with_label_values(&["middleware-labels", "GET", "/api/v1/health", "200"])
            .get();
        assert_eq!(ok, 2);
        let missing = metrics::HTTP_REQUESTS_TOTAL
            .with_label_values(&["middleware-labels", "GET", "other", "404"])
            .get();
        assert_eq!(missing, 1);
        let observed = metrics::HTTP_REQUEST_DURATION_SECONDS
            .with_label_values(&["middleware-labels", "GET", "/api/v1/health"])
            .get_sample_count();
        assert_eq!(observed, 2);
    }
}
