//! Health, readiness and metrics endpoints

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::http::AppState;
use crate::observability::metrics;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
}

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub service: String,
    pub version: String,
    pub active_streams: usize,
    pub timestamp: i64,
}

/// Liveness (always OK while the server runs)
pub async fn health_check(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "healthy",
        service: state.service_name.clone(),
        version: state.service_version.clone(),
        active_streams: state.api.active_streams(),
        timestamp: chrono::Utc::now().timestamp(),
    })
}

#[derive(Debug, Serialize)]
pub struct ReadyBody {
    pub status: &'static str,
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Readiness with registry state
///
/// An unregistered instance still serves traffic; it reports `degraded`.
pub async fn readiness(State(state): State<AppState>) -> Json<ReadyBody> {
    let (registered, instance_id) = match &state.registry {
        Some(registry) => (registry.is_registered().await, Some(registry.instance_id().to_string())),
        None => (false, None),
    };

    Json(ReadyBody {
        status: if registered { "ready" } else { "degraded" },
        registered,
        instance_id,
    })
}

/// Prometheus text exposition
pub async fn metrics() -> Response {
    match metrics::gather_metrics() {
        Ok(body) => ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
