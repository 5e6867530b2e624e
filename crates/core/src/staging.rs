// crates/core/src/staging.rs
//! On-disk holding area for uploaded inputs and generated videos.
//!
//! Every file written here is represented by exactly one [`StagedFile`]
//! handle. Dropping the handle deletes the file, so lifetime follows
//! ownership: a job record owning its inputs, or a request scope owning the
//! output it is about to send.

use std::fmt;
use std::path::{Path, PathBuf};

use iavatar_types::JobId;

use crate::error::StagingError;

/// Logical owner of a staged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Held by a job record in the registry.
    Job(JobId),
    /// Held by the synchronous request that produced the job.
    Request(JobId),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Job(id) => write!(f, "job:{id}"),
            Owner::Request(id) => write!(f, "request:{id}"),
        }
    }
}

/// What a staged file holds. Used in file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedKind {
    Image,
    Audio,
    Result,
}

impl StagedKind {
    fn as_str(self) -> &'static str {
        match self {
            StagedKind::Image => "image",
            StagedKind::Audio => "audio",
            StagedKind::Result => "result",
        }
    }
}

/// Owning handle to one file in the staging directory.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    owner: Owner,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Hand the file to a new owner. The handle moves with it; the previous
    /// owner keeps nothing.
    pub fn transfer(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    pub async fn read(&self) -> Result<Vec<u8>, StagingError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| StagingError::io(&self.path, e))
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), owner = %self.owner, "Removed staged file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), owner = %self.owner, error = %e, "Failed to remove staged file");
            }
        }
    }
}

/// Scoped staging directory.
#[derive(Debug, Clone)]
pub struct StagingStore {
    root: PathBuf,
}

impl StagingStore {
    /// Open (creating if needed) the staging directory at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StagingError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StagingError::RootUnavailable {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist uploaded bytes for `job_id` and return the owning handle.
    pub async fn stage(
        &self,
        job_id: JobId,
        kind: StagedKind,
        extension: &str,
        bytes: &[u8],
    ) -> Result<StagedFile, StagingError> {
        let path = self.path_for(job_id, kind, extension);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StagingError::io(&path, e))?;
        Ok(StagedFile {
            path,
            owner: Owner::Job(job_id),
        })
    }

    /// Take ownership of a file the pipeline produced at `path`.
    pub fn adopt(&self, owner: Owner, path: impl Into<PathBuf>) -> StagedFile {
        StagedFile {
            path: path.into(),
            owner,
        }
    }

    /// Canonical location of a job's finished video.
    pub fn output_path(&self, job_id: JobId) -> PathBuf {
        self.path_for(job_id, StagedKind::Result, "mp4")
    }

    /// Scratch directory handed to the pipeline for one job.
    pub fn work_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(format!("{job_id}_work"))
    }

    /// Remove everything left in the staging directory.
    ///
    /// Job identifiers do not survive a restart, so anything found at startup
    /// is unreachable. Returns the number of entries removed.
    pub fn purge(&self) -> Result<usize, StagingError> {
        let entries =
            std::fs::read_dir(&self.root).map_err(|e| StagingError::io(&self.root, e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StagingError::io(&self.root, e))?;
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to purge stale staging entry");
                }
            }
        }
        Ok(removed)
    }

    fn path_for(&self, job_id: JobId, kind: StagedKind, extension: &str) -> PathBuf {
        self.root
            .join(format!("{job_id}_{}.{extension}", kind.as_str()))
    }
}
