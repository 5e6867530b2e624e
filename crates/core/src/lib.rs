// crates/core/src/lib.rs
pub mod error;
pub mod inference;
pub mod media;
pub mod staging;

pub use error::*;
pub use inference::{
    CommandPipeline, InferenceAdapter, InferencePipeline, InferenceRequest, PipelineJob,
};
pub use media::{probe_audio, probe_image, AudioInfo, ImageInfo};
pub use staging::{Owner, StagedFile, StagedKind, StagingStore};
