// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use iavatar_core::{InferenceAdapter, InferencePipeline, StagingError, StagingStore};
use iavatar_server_jobs::{AdmissionGate, JobRegistry, JobScheduler};

use crate::config::Config;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    pub config: Config,
    /// Every job this process has accepted and not yet released.
    pub registry: Arc<JobRegistry>,
    pub scheduler: JobScheduler,
    /// Where uploads and results live on disk.
    pub staging: StagingStore,
}

impl AppState {
    /// Build the job system around `pipeline`, opening the staging directory
    /// named by `config`.
    pub fn new(
        config: Config,
        pipeline: Arc<dyn InferencePipeline>,
    ) -> Result<Arc<Self>, StagingError> {
        let staging = StagingStore::open(config.staging_dir())?;
        let registry = Arc::new(JobRegistry::new());
        let scheduler = JobScheduler::new(
            Arc::clone(&registry),
            AdmissionGate::new(config.max_concurrent_inference),
            InferenceAdapter::new(pipeline, config.inference_timeout()),
            staging.clone(),
        );
        Ok(Arc::new(Self {
            start_time: Instant::now(),
            config,
            registry,
            scheduler,
            staging,
        }))
    }

    pub fn adapter(&self) -> &InferenceAdapter {
        self.scheduler.adapter()
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
