// crates/server-jobs/src/types.rs
//! Types for the job system.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use iavatar_core::StagedFile;
use iavatar_types::{GenerationOptions, JobError, JobId, JobState};

/// Which API path created the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrigin {
    /// `/generate-avatar`: a request is blocked waiting for the result.
    Sync,
    /// `/generate-avatar-async`: the client polls by id.
    Async,
}

/// Staged uploads a job consumes. Dropped (and deleted) once the job is
/// terminal.
#[derive(Debug)]
pub struct JobInputs {
    pub image: StagedFile,
    pub audio: StagedFile,
}

/// A requested state change, carrying what the new state needs.
#[derive(Debug)]
pub enum Transition {
    Start,
    Complete(StagedFile),
    Fail(JobError),
}

impl Transition {
    pub fn target(&self) -> JobState {
        match self {
            Transition::Start => JobState::Processing,
            Transition::Complete(_) => JobState::Completed,
            Transition::Fail(_) => JobState::Failed,
        }
    }
}

/// Job record owned by the registry.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub origin: JobOrigin,
    pub params: GenerationOptions,
    pub inputs: Option<JobInputs>,
    /// Write-once. Shared only as a read lease: the file is deleted when the
    /// record and every in-flight reader have let go of it.
    pub output: Option<Arc<StagedFile>>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Every state the job has been in, in order.
    pub history: Vec<JobState>,
    pub(crate) abandoned: bool,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        params: GenerationOptions,
        inputs: JobInputs,
        origin: JobOrigin,
    ) -> Self {
        Self {
            id,
            state: JobState::Queued,
            origin,
            params,
            inputs: Some(inputs),
            output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            history: vec![JobState::Queued],
            abandoned: false,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            state: self.state,
            origin: self.origin,
            params: self.params,
            image_path: self.inputs.as_ref().map(|i| i.image.path().to_path_buf()),
            audio_path: self.inputs.as_ref().map(|i| i.audio.path().to_path_buf()),
            output: self.output.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            history: self.history.clone(),
        }
    }

    /// Move into `state`, stamping times. On terminal states the inputs are
    /// detached and returned so the caller decides where they are dropped.
    /// Callers have already validated the move.
    pub(crate) fn enter(&mut self, state: JobState) -> Option<JobInputs> {
        self.state = state;
        self.history.push(state);
        match state {
            JobState::Processing => {
                self.started_at = Some(Utc::now());
                None
            }
            JobState::Completed | JobState::Failed => {
                self.completed_at = Some(Utc::now());
                self.inputs.take()
            }
            JobState::Queued => None,
        }
    }
}

/// Point-in-time copy of a job, safe to hold outside the registry.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub origin: JobOrigin,
    pub params: GenerationOptions,
    pub image_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
    pub output: Option<Arc<StagedFile>>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub history: Vec<JobState>,
}

impl JobSnapshot {
    pub fn output_path(&self) -> Option<&Path> {
        self.output.as_deref().map(StagedFile::path)
    }
}
