// crates/types/src/lib.rs
//! Shared wire types for the iAvatar service.
//!
//! Everything here is serialized onto the HTTP surface, so field and variant
//! names are part of the public contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Job identity and lifecycle
// ============================================================================

/// Opaque job identifier. Generated at submission and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job.
///
/// Transitions are forward-only: `Queued -> Processing -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Processing)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "Queued",
            JobState::Processing => "Processing",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Generation options
// ============================================================================

/// How the source image is prepared before animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preprocess {
    #[default]
    Crop,
    Resize,
    Full,
}

impl Preprocess {
    pub fn as_str(self) -> &'static str {
        match self {
            Preprocess::Crop => "crop",
            Preprocess::Resize => "resize",
            Preprocess::Full => "full",
        }
    }
}

impl FromStr for Preprocess {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crop" => Ok(Preprocess::Crop),
            "resize" => Ok(Preprocess::Resize),
            "full" => Ok(Preprocess::Full),
            _ => Err(OptionError::InvalidPreprocess(s.to_string())),
        }
    }
}

impl fmt::Display for Preprocess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated generation options passed through to the inference pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub preprocess: Preprocess,
    pub still: bool,
    pub use_enhancer: bool,
}

impl GenerationOptions {
    /// Build options from raw, optional request values. Missing values take
    /// their defaults.
    pub fn from_raw(
        preprocess: Option<&str>,
        still: Option<&str>,
        use_enhancer: Option<&str>,
    ) -> Result<Self, OptionError> {
        let preprocess = preprocess.map(str::parse).transpose()?.unwrap_or_default();
        let still = still
            .map(|v| parse_flag("still", v))
            .transpose()?
            .unwrap_or(false);
        let use_enhancer = use_enhancer
            .map(|v| parse_flag("use_enhancer", v))
            .transpose()?
            .unwrap_or(false);
        Ok(Self {
            preprocess,
            still,
            use_enhancer,
        })
    }
}

fn parse_flag(field: &'static str, value: &str) -> Result<bool, OptionError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(OptionError::InvalidFlag {
            field,
            value: value.to_string(),
        }),
    }
}

/// Rejected generation option.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("preprocess must be one of crop, resize, full (got {0:?})")]
    InvalidPreprocess(String),

    #[error("{field} must be a boolean (got {value:?})")]
    InvalidFlag { field: &'static str, value: String },
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Closed set of failure kinds visible to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    InputDecodeError,
    ResourceExhaustedError,
    PipelineError,
    TimeoutError,
    NotFoundError,
    InvalidTransitionError,
    InternalError,
    ServiceUnavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::InputDecodeError => "InputDecodeError",
            ErrorKind::ResourceExhaustedError => "ResourceExhaustedError",
            ErrorKind::PipelineError => "PipelineError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::NotFoundError => "NotFoundError",
            ErrorKind::InvalidTransitionError => "InvalidTransitionError",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::ServiceUnavailable => "ServiceUnavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure recorded on a job and returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub error_kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_machine_is_forward_only() {
        use JobState::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Queued));
        for terminal in [Completed, Failed] {
            for next in [Queued, Processing, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_options_defaults() {
        let opts = GenerationOptions::from_raw(None, None, None).unwrap();
        assert_eq!(opts, GenerationOptions::default());
        assert_eq!(opts.preprocess, Preprocess::Crop);
        assert!(!opts.still);
        assert!(!opts.use_enhancer);
    }

    #[test]
    fn test_options_parse_values() {
        let opts = GenerationOptions::from_raw(Some("Full"), Some("yes"), Some("1")).unwrap();
        assert_eq!(opts.preprocess, Preprocess::Full);
        assert!(opts.still);
        assert!(opts.use_enhancer);
    }

    #[test]
    fn test_options_reject_unknown_values() {
        assert_eq!(
            GenerationOptions::from_raw(Some("zoom"), None, None),
            Err(OptionError::InvalidPreprocess("zoom".into()))
        );
        let err = GenerationOptions::from_raw(None, Some("maybe"), None).unwrap_err();
        assert!(err.to_string().contains("still"));
    }

    #[test]
    fn test_job_id_roundtrip_via_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_error_wire_shape() {
        let err = JobError::new(ErrorKind::TimeoutError, "took too long");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"error_kind": "TimeoutError", "message": "took too long"})
        );
        assert_eq!(serde_json::to_value(JobState::Queued).unwrap(), "Queued");
    }
}
