// Module: http
// Connect RPC routes plus health, readiness and metrics endpoints

pub mod health;

use axum::{middleware, routing::get, Router};
use http::HeaderName;
use marketsim_cluster::ServiceRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::connect::{self, PROTOCOL_VERSION_HEADER, TIMEOUT_HEADER};
use crate::impls::MarketDataApiImpl;
use crate::observability::metrics_middleware::metrics_layer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub api: Arc<MarketDataApiImpl>,
    /// Absent when the process runs without a registry
    pub registry: Option<Arc<ServiceRegistry>>,
    pub service_name: String,
    pub service_version: String,
    pub channel_capacity: usize,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(PROTOCOL_VERSION_HEADER),
            HeaderName::from_static(TIMEOUT_HEADER),
        ]);

    Router::new()
        .nest("/api/v1", health::create_health_router())
        .route("/metrics", get(health::metrics))
        .merge(connect::create_connect_router())
        .layer(middleware::from_fn_with_state(state.clone(), metrics_layer))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        // Apply state to all routes (must be last)
        .with_state(state)
}

/// Serve `router` on `listener` (HTTP/1.1 and h2c) until `shutdown` fires
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> anyhow::Result<()> {
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
