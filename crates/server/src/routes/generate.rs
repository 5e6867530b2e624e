// crates/server/src/routes/generate.rs
//! Generation endpoints.
//!
//! - `POST /generate-avatar` blocks until the video is ready.
//! - `POST /generate-avatar-async` returns a job id to poll.

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, Multipart, Query, State},
    response::Response,
    routing::post,
    Json, Router,
};
use iavatar_core::StagedKind;
use iavatar_server_jobs::{JobInputs, JobOrigin, JobRegistry};
use iavatar_types::{ErrorKind, JobError, JobId, JobState};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::metrics::record_submitted;
use crate::routes::video_response;
use crate::state::AppState;
use crate::upload::{read_generation_upload, OptionQuery};

/// Response for an accepted async job.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct JobAccepted {
    pub job_id: JobId,
    pub state: JobState,
}

/// Validate, stage and queue one generation request.
async fn submit(
    state: &AppState,
    multipart: Multipart,
    query: &OptionQuery,
    origin: JobOrigin,
) -> ApiResult<JobId> {
    if !state.adapter().is_initialized() {
        return Err(ApiError::ServiceUnavailable(
            "Inference pipeline is not initialized".into(),
        ));
    }

    let upload = read_generation_upload(multipart, query, state.config.max_upload_bytes).await?;

    let id = JobId::new();
    let image = state
        .staging
        .stage(id, StagedKind::Image, upload.image_info.extension(), &upload.image)
        .await?;
    let audio = state
        .staging
        .stage(id, StagedKind::Audio, upload.audio_info.extension(), &upload.audio)
        .await?;

    state
        .registry
        .create(id, upload.options, JobInputs { image, audio }, origin)?;
    record_submitted(match origin {
        JobOrigin::Sync => "sync",
        JobOrigin::Async => "async",
    });
    tracing::info!(job_id = %id, origin = ?origin, options = ?upload.options, "Job accepted");

    state.scheduler.submit(id);
    Ok(id)
}

/// Abandons a synchronous job if the request scope ends before the job's
/// record was taken, e.g. when the client disconnects.
struct AbandonOnDrop<'a> {
    registry: &'a JobRegistry,
    id: JobId,
    armed: bool,
}

impl AbandonOnDrop<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.abandon(self.id);
        }
    }
}

/// POST /generate-avatar - Generate a video and return its bytes.
pub async fn generate_avatar(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OptionQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Response> {
    let id = submit(&state, multipart?, &query, JobOrigin::Sync).await?;
    let mut guard = AbandonOnDrop {
        registry: &state.registry,
        id,
        armed: true,
    };

    let mut rx = state.registry.subscribe(id)?;
    let wait = state.config.sync_wait();
    let finished = tokio::time::timeout(wait, async {
        rx.wait_for(|s| s.is_terminal()).await.map(|_| ())
    })
    .await;

    match finished {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            return Err(ApiError::Internal(format!(
                "job {id} left the registry before finishing"
            )));
        }
        Err(_) => {
            tracing::warn!(job_id = %id, wait_secs = wait.as_secs(), "Synchronous wait expired");
            return Err(ApiError::JobFailed(JobError::new(
                ErrorKind::TimeoutError,
                format!("Job did not finish within {}s", wait.as_secs()),
            )));
        }
    }

    let job = state.registry.take(id)?;
    guard.disarm();

    match (job.state, &job.output) {
        (JobState::Completed, Some(output)) => {
            let bytes = output.read().await?;
            tracing::info!(job_id = %id, bytes = bytes.len(), "Returning generated video");
            Ok(video_response(id, bytes))
            // `job` drops here, deleting the output file.
        }
        (JobState::Failed, _) => Err(ApiError::JobFailed(job.error.clone().unwrap_or_else(
            || JobError::new(ErrorKind::InternalError, "job failed without an error"),
        ))),
        (other, _) => Err(ApiError::Internal(format!(
            "job {id} taken in unexpected state {other}"
        ))),
    }
}

/// POST /generate-avatar-async - Queue a job and return its id.
pub async fn generate_avatar_async(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OptionQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<JobAccepted>> {
    let id = submit(&state, multipart?, &query, JobOrigin::Async).await?;
    Ok(Json(JobAccepted {
        job_id: id,
        state: JobState::Queued,
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/generate-avatar", post(generate_avatar))
        .route("/generate-avatar-async", post(generate_avatar_async))
}
