// crates/server/src/routes/health.rs
//! Liveness and readiness endpoints.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Response for `GET /`.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RootResponse {
    pub message: String,
    pub status: String,
}

/// Response for `GET /health`.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// `healthy` when the pipeline can serve requests, `degraded` otherwise.
    pub status: String,
    pub pipeline_initialized: bool,
    pub gpu_available: bool,
    pub version: String,
    pub uptime_secs: u64,
}

/// GET / - Liveness probe.
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "iAvatar API is running".to_string(),
        status: "healthy".to_string(),
    })
}

/// GET /health - Readiness probe.
///
/// Always 200; an uninitialized pipeline reports `degraded`.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let adapter = state.adapter();
    let pipeline_initialized = adapter.is_initialized();
    Json(HealthResponse {
        status: if pipeline_initialized { "healthy" } else { "degraded" }.to_string(),
        pipeline_initialized,
        gpu_available: pipeline_initialized && adapter.gpu_available(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
    })
}

/// Create the health routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
}
