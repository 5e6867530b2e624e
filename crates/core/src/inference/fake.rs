// crates/core/src/inference/fake.rs
//! In-process stand-in for the GPU pipeline, for tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{InferencePipeline, PipelineJob};
use crate::error::InferenceError;

/// Minimal bytes that look like the start of an MP4 file.
pub const FAKE_MP4: &[u8] = b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00mp42isom";

#[derive(Debug, Clone)]
pub enum FakeOutcome {
    /// Write [`FAKE_MP4`] into the result directory.
    Succeed,
    Fail(InferenceError),
}

/// Configurable fake pipeline that records how it was driven.
#[derive(Debug)]
pub struct FakePipeline {
    delay: Duration,
    outcome: FakeOutcome,
    honor_cancel: bool,
    initialized: AtomicBool,
    gpu: AtomicBool,
    calls: AtomicUsize,
    finished: AtomicUsize,
    cancelled: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakePipeline {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: FakeOutcome::Succeed,
            honor_cancel: true,
            initialized: AtomicBool::new(true),
            gpu: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_outcome(mut self, outcome: FakeOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Keep running after cancellation, like a pipeline that cannot be
    /// interrupted mid-flight.
    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    pub fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::SeqCst);
    }

    pub fn set_gpu(&self, value: bool) {
        self.gpu.store(value, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that ran to the end (not cut short by cancellation).
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `run` calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Default for FakePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl InferencePipeline for FakePipeline {
    fn run(
        &self,
        job: &PipelineJob<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let deadline = Instant::now() + self.delay;
        let mut was_cancelled = false;
        while Instant::now() < deadline {
            if self.honor_cancel && cancel.is_cancelled() {
                was_cancelled = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if was_cancelled {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            return Err(InferenceError::Pipeline("cancelled".into()));
        }
        self.finished.fetch_add(1, Ordering::SeqCst);

        match &self.outcome {
            FakeOutcome::Succeed => {
                let path = job.result_dir.join("generated.mp4");
                std::fs::write(&path, FAKE_MP4)
                    .map_err(|e| InferenceError::Pipeline(e.to_string()))?;
                Ok(path)
            }
            FakeOutcome::Fail(err) => Err(err.clone()),
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn gpu_available(&self) -> bool {
        self.gpu.load(Ordering::SeqCst)
    }
}
