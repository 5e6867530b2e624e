// crates/server-jobs/src/error.rs
use iavatar_types::{JobId, JobState};
use thiserror::Error;

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} already exists")]
    Duplicate { id: JobId },

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Job {id} is still {state}")]
    NotTerminal { id: JobId, state: JobState },

    /// The job's owner went away before it started; it has been removed.
    #[error("Job {0} was abandoned before it started")]
    Abandoned(JobId),
}

/// The admission gate was shut down while a job waited for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Admission gate closed")]
pub struct GateClosed;
