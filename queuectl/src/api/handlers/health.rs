use axum::{Json, extract::State};

use crate::AppState;
use crate::api::models::health::{FEATURES, HealthResponse, RootResponse};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name, status and version.
#[utoipa::path(
    get,
    path = "/",
    tag = "health",
    responses((status = 200, description = "Service is up", body = RootResponse))
)]
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        name: "queuectl".to_string(),
        status: "running".to_string(),
        version: VERSION.to_string(),
    })
}

/// Liveness with queue statistics. The backend is not contacted.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        backend_url: state.backend.base_url(),
        queue_size: state.store.queue_depth(),
        stats: state.store.stats(),
        version: VERSION.to_string(),
        features: FEATURES.iter().map(|feature| feature.to_string()).collect(),
    })
}
