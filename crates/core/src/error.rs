// crates/core/src/error.rs
use std::path::PathBuf;
use std::time::Duration;

use iavatar_types::{ErrorKind, JobError};
use thiserror::Error;

/// Errors raised while writing to or managing the staging directory.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Staging directory unavailable: {path}: {source}")]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error staging {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StagingError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised when an uploaded payload is not usable media.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Image is empty")]
    EmptyImage,

    #[error("Unsupported image format{}", .0.as_deref().map(|f| format!(": {f}")).unwrap_or_default())]
    UnsupportedImage(Option<String>),

    #[error("Image could not be decoded: {0}")]
    CorruptImage(String),

    #[error("Audio is empty")]
    EmptyAudio,

    #[error("Unsupported audio container (expected WAV): {0}")]
    UnsupportedAudio(String),

    #[error("Audio could not be decoded: {0}")]
    CorruptAudio(String),

    #[error("Audio contains no samples")]
    SilentAudio,
}

/// Failures from one inference execution, closed over the taxonomy clients see.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("Input media could not be decoded by the pipeline: {0}")]
    InputDecode(String),

    #[error("GPU resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Pipeline failed: {0}")]
    Pipeline(String),

    #[error("Inference exceeded {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

impl InferenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::InputDecode(_) => ErrorKind::InputDecodeError,
            InferenceError::ResourceExhausted(_) => ErrorKind::ResourceExhaustedError,
            InferenceError::Pipeline(_) => ErrorKind::PipelineError,
            InferenceError::Timeout(_) => ErrorKind::TimeoutError,
        }
    }

    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.kind(), self.to_string())
    }
}
