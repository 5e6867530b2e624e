// crates/server/src/routes/jobs.rs
//! Job status polling.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use iavatar_types::{JobError, JobId, JobState};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::routes::video_response;
use crate::state::AppState;

/// Status of a job that has no video to return.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// GET /job/{job_id} - Poll an async job.
///
/// Pending jobs report their state; completed jobs return the video bytes;
/// failed jobs return the recorded error. Jobs stay pollable until swept.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let id: JobId = job_id
        .parse()
        .map_err(|_| ApiError::JobNotFound(job_id.clone()))?;
    let snapshot = state.registry.get(id)?;

    match snapshot.state {
        JobState::Completed => {
            let output = snapshot.output.ok_or_else(|| {
                ApiError::Internal(format!("completed job {id} has no output"))
            })?;
            // The snapshot's lease keeps the file alive through the read even
            // if the job is swept meanwhile.
            let bytes = output.read().await?;
            Ok(video_response(id, bytes))
        }
        JobState::Failed => Ok(Json(JobStatusResponse {
            job_id: id,
            state: JobState::Failed,
            error: snapshot.error,
        })
        .into_response()),
        pending => Ok(Json(JobStatusResponse {
            job_id: id,
            state: pending,
            error: None,
        })
        .into_response()),
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/job/{job_id}", get(get_job))
}
