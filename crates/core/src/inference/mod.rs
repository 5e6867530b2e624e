// crates/core/src/inference/mod.rs
//! Boundary to the external video-synthesis pipeline.
//!
//! - `InferencePipeline` is the collaborator: one blocking call per video.
//! - `InferenceAdapter` runs that call on the blocking pool under a hard
//!   wall-clock timeout and normalizes where the output lands.
//!
//! The pipeline cannot be preempted reliably. On timeout the adapter signals
//! the cancellation token, stops waiting, and leaves a reaper task behind to
//! delete whatever the abandoned call eventually produces.

mod command;
#[cfg(any(test, feature = "fixtures"))]
pub mod fake;

pub use command::{classify_failure, CommandPipeline};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use iavatar_types::{GenerationOptions, JobId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::InferenceError;

/// Inputs for a single pipeline invocation.
#[derive(Debug, Clone, Copy)]
pub struct PipelineJob<'a> {
    pub image: &'a Path,
    pub audio: &'a Path,
    pub options: GenerationOptions,
    /// Scratch directory the pipeline may write into. Removed afterwards.
    pub result_dir: &'a Path,
}

/// The opaque synthesis pipeline.
///
/// `run` blocks until a video exists (returning its path) or the pipeline
/// fails. Implementations should check `cancel` when they can; the adapter
/// does not rely on it.
pub trait InferencePipeline: Send + Sync + 'static {
    fn run(
        &self,
        job: &PipelineJob<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, InferenceError>;

    /// Whether models and scripts are in place to serve requests.
    fn is_initialized(&self) -> bool;

    fn gpu_available(&self) -> bool;
}

/// One job's worth of work for the adapter.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub job_id: JobId,
    pub image: PathBuf,
    pub audio: PathBuf,
    pub options: GenerationOptions,
    pub work_dir: PathBuf,
    /// Where the finished video is moved before `run` returns.
    pub output_path: PathBuf,
}

/// Timeout-enforcing wrapper around an [`InferencePipeline`].
#[derive(Clone)]
pub struct InferenceAdapter {
    pipeline: Arc<dyn InferencePipeline>,
    timeout: Duration,
}

impl InferenceAdapter {
    pub fn new(pipeline: Arc<dyn InferencePipeline>, timeout: Duration) -> Self {
        Self { pipeline, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_initialized(&self) -> bool {
        self.pipeline.is_initialized()
    }

    pub fn gpu_available(&self) -> bool {
        self.pipeline.gpu_available()
    }

    /// Run the pipeline once. Never retries.
    pub async fn run(&self, request: InferenceRequest) -> Result<PathBuf, InferenceError> {
        let job_id = request.job_id;
        let output_path = request.output_path.clone();
        let cancel = CancellationToken::new();
        let pipeline = Arc::clone(&self.pipeline);
        let token = cancel.clone();
        let started = Instant::now();

        let mut handle = tokio::task::spawn_blocking(move || execute(&*pipeline, &request, &token));

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => {
                tracing::debug!(
                    job_id = %job_id,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    ok = result.is_ok(),
                    "Inference returned"
                );
                result
            }
            Ok(Err(join_err)) => {
                tracing::error!(job_id = %job_id, error = %join_err, "Inference task panicked");
                Err(InferenceError::Pipeline(format!(
                    "inference task aborted: {join_err}"
                )))
            }
            Err(_) => {
                cancel.cancel();
                tracing::warn!(
                    job_id = %job_id,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Inference timed out; abandoning execution"
                );
                tokio::spawn(reap_late_result(job_id, handle, output_path));
                Err(InferenceError::Timeout(self.timeout))
            }
        }
    }
}

fn execute(
    pipeline: &dyn InferencePipeline,
    request: &InferenceRequest,
    cancel: &CancellationToken,
) -> Result<PathBuf, InferenceError> {
    std::fs::create_dir_all(&request.work_dir).map_err(|e| {
        InferenceError::Pipeline(format!(
            "cannot create work dir {}: {e}",
            request.work_dir.display()
        ))
    })?;

    let job = PipelineJob {
        image: &request.image,
        audio: &request.audio,
        options: request.options,
        result_dir: &request.work_dir,
    };
    let result = pipeline
        .run(&job, cancel)
        .and_then(|produced| move_output(&produced, &request.output_path));

    if let Err(e) = std::fs::remove_dir_all(&request.work_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %request.work_dir.display(), error = %e, "Failed to remove work dir");
        }
    }

    result.map(|()| request.output_path.clone())
}

fn move_output(produced: &Path, dest: &Path) -> Result<(), InferenceError> {
    if produced == dest {
        return Ok(());
    }
    if std::fs::rename(produced, dest).is_ok() {
        return Ok(());
    }
    // Cross-device: fall back to copy + delete.
    std::fs::copy(produced, dest)
        .and_then(|_| std::fs::remove_file(produced))
        .map_err(|e| {
            InferenceError::Pipeline(format!(
                "cannot move output {} to {}: {e}",
                produced.display(),
                dest.display()
            ))
        })
}

async fn reap_late_result(
    job_id: JobId,
    handle: JoinHandle<Result<PathBuf, InferenceError>>,
    output_path: PathBuf,
) {
    let late = handle.await;
    let produced = matches!(late, Ok(Ok(_)));
    match std::fs::remove_file(&output_path) {
        Ok(()) => {
            tracing::info!(job_id = %job_id, path = %output_path.display(), "Discarded late inference result");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(job_id = %job_id, produced, "Abandoned inference finished without output");
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, path = %output_path.display(), error = %e, "Failed to discard late inference result");
        }
    }
}
