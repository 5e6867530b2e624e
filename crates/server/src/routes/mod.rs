//! HTTP route handlers for the avatar service.

pub mod generate;
pub mod health;
pub mod jobs;
pub mod metrics;

use std::sync::Arc;

use axum::{
    http::header,
    response::{IntoResponse, Response},
    Router,
};
use iavatar_types::JobId;

use crate::state::AppState;

/// Create the combined router.
///
/// Routes:
/// - GET  / - Liveness
/// - GET  /health - Readiness (pipeline and GPU status)
/// - POST /generate-avatar - Generate and return the video
/// - POST /generate-avatar-async - Queue a job
/// - GET  /job/{job_id} - Poll a job
/// - GET  /metrics - Prometheus metrics
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(generate::router())
        .merge(jobs::router())
        .merge(metrics::router())
        .with_state(state)
}

/// MP4 download response for a finished job.
pub(crate) fn video_response(id: JobId, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"avatar_{id}.mp4\""),
            ),
        ],
        bytes,
    )
        .into_response()
}
