// crates/server-jobs/src/scheduler.rs
//! Runs queued jobs through the admission gate and the inference adapter.

use std::sync::Arc;
use std::time::Instant;

use iavatar_core::{InferenceAdapter, InferenceRequest, Owner, StagingStore};
use iavatar_types::JobId;
use tokio::task::JoinHandle;

use crate::error::RegistryError;
use crate::gate::AdmissionGate;
use crate::registry::JobRegistry;
use crate::types::Transition;

/// Spawns one background task per submitted job.
///
/// Per job: acquire slot -> `Processing` -> run adapter -> `Completed` or
/// `Failed` -> release slot. The slot is an RAII guard, so it is released
/// on every path out of the task.
#[derive(Clone)]
pub struct JobScheduler {
    registry: Arc<JobRegistry>,
    gate: AdmissionGate,
    adapter: InferenceAdapter,
    staging: StagingStore,
}

impl JobScheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        gate: AdmissionGate,
        adapter: InferenceAdapter,
        staging: StagingStore,
    ) -> Self {
        Self {
            registry,
            gate,
            adapter,
            staging,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn adapter(&self) -> &InferenceAdapter {
        &self.adapter
    }

    /// Start running a queued job in the background.
    ///
    /// The returned handle is only needed by callers that want to join the
    /// task; dropping it does not cancel the job.
    pub fn submit(&self, id: JobId) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_job(id).await })
    }

    async fn run_job(&self, id: JobId) {
        let slot = match self.gate.acquire().await {
            Ok(slot) => slot,
            Err(_) => {
                // Shutting down; the job stays Queued and dies with the registry.
                tracing::info!(job_id = %id, "Admission gate closed; job left queued");
                return;
            }
        };
        metrics::gauge!("iavatar_admission_slots_available").set(self.gate.available() as f64);

        if let Err(e) = self.registry.transition(id, Transition::Start) {
            self.transition_failed(id, e);
            return;
        }

        let request = match self.registry.get(id) {
            Ok(snap) => match (snap.image_path, snap.audio_path) {
                (Some(image), Some(audio)) => InferenceRequest {
                    job_id: id,
                    image,
                    audio,
                    options: snap.params,
                    work_dir: self.staging.work_dir(id),
                    output_path: self.staging.output_path(id),
                },
                _ => {
                    self.breach(id, "staged inputs missing for processing job");
                    return;
                }
            },
            Err(e) => {
                self.transition_failed(id, e);
                return;
            }
        };

        tracing::info!(job_id = %id, options = ?request.options, "Inference started");
        let started = Instant::now();
        let result = self.adapter.run(request).await;
        let elapsed = started.elapsed();
        metrics::histogram!("iavatar_inference_duration_seconds").record(elapsed.as_secs_f64());

        let transition = match result {
            Ok(path) => {
                tracing::info!(job_id = %id, elapsed_secs = elapsed.as_secs_f64(), "Job completed");
                metrics::counter!("iavatar_jobs_finished_total", "outcome" => "completed")
                    .increment(1);
                Transition::Complete(self.staging.adopt(Owner::Job(id), path))
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error_kind = %e.kind(), error = %e, "Job failed");
                metrics::counter!("iavatar_jobs_finished_total", "outcome" => "failed")
                    .increment(1);
                Transition::Fail(e.to_job_error())
            }
        };

        if let Err(e) = self.registry.transition(id, transition) {
            self.transition_failed(id, e);
        }

        drop(slot);
        metrics::gauge!("iavatar_admission_slots_available").set(self.gate.available() as f64);
    }

    fn transition_failed(&self, id: JobId, error: RegistryError) {
        match error {
            // The job was abandoned and removed, or swept; nothing left to fail.
            RegistryError::NotFound(_) => {
                tracing::warn!(job_id = %id, "Job disappeared while running");
            }
            RegistryError::Abandoned(_) => {
                metrics::counter!("iavatar_jobs_finished_total", "outcome" => "abandoned")
                    .increment(1);
            }
            other => self.breach(id, &other.to_string()),
        }
    }

    fn breach(&self, id: JobId, message: &str) {
        tracing::error!(job_id = %id, error = %message, "Job invariant violated; failing job as InternalError");
        metrics::counter!("iavatar_jobs_finished_total", "outcome" => "internal_error").increment(1);
        self.registry.fail_internal(id, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobInputs, JobOrigin};
    use iavatar_core::inference::fake::{FakeOutcome, FakePipeline};
    use iavatar_core::{InferenceError, StagedKind};
    use iavatar_types::{ErrorKind, GenerationOptions, JobState};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        staging: StagingStore,
        registry: Arc<JobRegistry>,
        scheduler: JobScheduler,
    }

    fn harness(pipeline: Arc<FakePipeline>, capacity: usize, timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::open(dir.path()).unwrap();
        let registry = Arc::new(JobRegistry::new());
        let scheduler = JobScheduler::new(
            Arc::clone(&registry),
            AdmissionGate::new(capacity),
            InferenceAdapter::new(pipeline, timeout),
            staging.clone(),
        );
        Harness {
            _dir: dir,
            staging,
            registry,
            scheduler,
        }
    }

    impl Harness {
        async fn queue(&self) -> JobId {
            let id = JobId::new();
            let inputs = JobInputs {
                image: self
                    .staging
                    .stage(id, StagedKind::Image, "png", b"img")
                    .await
                    .unwrap(),
                audio: self
                    .staging
                    .stage(id, StagedKind::Audio, "wav", b"wav")
                    .await
                    .unwrap(),
            };
            self.registry
                .create(id, GenerationOptions::default(), inputs, JobOrigin::Async)
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_job_completes() {
        let h = harness(Arc::new(FakePipeline::new()), 1, Duration::from_secs(5));
        let id = h.queue().await;
        let image = h.registry.get(id).unwrap().image_path.unwrap();

        h.scheduler.submit(id).await.unwrap();

        let snap = h.registry.get(id).unwrap();
        assert_eq!(
            snap.history,
            vec![JobState::Queued, JobState::Processing, JobState::Completed]
        );
        assert_eq!(snap.output_path(), Some(h.staging.output_path(id).as_path()));
        assert!(snap.output_path().unwrap().exists());
        assert!(!image.exists());
        assert_eq!(h.scheduler.gate().available(), 1);
    }

    #[tokio::test]
    async fn test_job_failure_is_recorded() {
        let pipeline = Arc::new(
            FakePipeline::new()
                .with_outcome(FakeOutcome::Fail(InferenceError::InputDecode("no face".into()))),
        );
        let h = harness(pipeline, 1, Duration::from_secs(5));
        let id = h.queue().await;

        h.scheduler.submit(id).await.unwrap();

        let snap = h.registry.get(id).unwrap();
        assert_eq!(snap.state, JobState::Failed);
        let error = snap.error.unwrap();
        assert_eq!(error.error_kind, ErrorKind::InputDecodeError);
        assert!(error.message.contains("no face"));
        assert!(snap.output.is_none());
        assert_eq!(h.scheduler.gate().available(), 1);
    }

    #[tokio::test]
    async fn test_no_automatic_retry() {
        let pipeline = Arc::new(
            FakePipeline::new()
                .with_outcome(FakeOutcome::Fail(InferenceError::Pipeline("boom".into()))),
        );
        let h = harness(pipeline.clone(), 1, Duration::from_secs(5));
        let id = h.queue().await;
        h.scheduler.submit(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipeline.calls(), 1);
        assert_eq!(h.registry.get(id).unwrap().state, JobState::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_bounds_processing() {
        let pipeline = Arc::new(FakePipeline::new().with_delay(Duration::from_millis(150)));
        let h = harness(pipeline.clone(), 1, Duration::from_secs(5));

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(h.queue().await);
        }
        let handles: Vec<_> = ids.iter().map(|id| h.scheduler.submit(*id)).collect();

        let mut sampled_processing = false;
        while !handles.iter().all(|j| j.is_finished()) {
            let processing = h.registry.count_in(JobState::Processing);
            assert!(processing <= 1, "saw {processing} jobs processing");
            sampled_processing |= processing == 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(sampled_processing);
        assert_eq!(pipeline.peak_concurrency(), 1);
        for id in ids {
            assert_eq!(h.registry.get(id).unwrap().state, JobState::Completed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_two_allows_overlap() {
        let pipeline = Arc::new(FakePipeline::new().with_delay(Duration::from_millis(200)));
        let h = harness(pipeline.clone(), 2, Duration::from_secs(5));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let id = h.queue().await;
            handles.push(h.scheduler.submit(id));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pipeline.peak_concurrency(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timeout_fails_job_and_frees_slot() {
        let pipeline = Arc::new(
            FakePipeline::new()
                .with_delay(Duration::from_millis(400))
                .ignoring_cancel(),
        );
        let timeout = Duration::from_millis(100);
        let h = harness(pipeline, 1, timeout);
        let slow = h.queue().await;
        let next = h.queue().await;

        let started = Instant::now();
        h.scheduler.submit(slow).await.unwrap();
        assert!(started.elapsed() < timeout + Duration::from_millis(250));

        let snap = h.registry.get(slow).unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(snap.error.unwrap().error_kind, ErrorKind::TimeoutError);
        assert_eq!(h.scheduler.gate().available(), 1);

        // The freed slot lets the next job start even though the abandoned
        // call is still running on the blocking pool.
        let handle = h.scheduler.submit(next);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ne!(h.registry.get(next).unwrap().state, JobState::Queued);
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!h.staging.output_path(slow).exists());
    }

    #[tokio::test]
    async fn test_abandoned_job_is_discarded_after_completion() {
        let pipeline = Arc::new(FakePipeline::new().with_delay(Duration::from_millis(100)));
        let h = harness(pipeline, 1, Duration::from_secs(5));
        let id = h.queue().await;

        let handle = h.scheduler.submit(id);
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.registry.abandon(id);
        handle.await.unwrap();

        assert!(h.registry.get(id).is_err());
        assert!(!h.staging.output_path(id).exists());
    }

    #[tokio::test]
    async fn test_closed_gate_leaves_job_queued() {
        let pipeline = Arc::new(FakePipeline::new());
        let h = harness(pipeline.clone(), 1, Duration::from_secs(5));
        let id = h.queue().await;
        h.scheduler.gate().close();

        h.scheduler.submit(id).await.unwrap();
        let snap = h.registry.get(id).unwrap();
        assert_eq!(snap.history, vec![JobState::Queued]);
        assert!(snap.error.is_none());
        assert_eq!(pipeline.calls(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_queued_job_never_runs() {
        let pipeline = Arc::new(FakePipeline::new());
        let h = harness(pipeline.clone(), 1, Duration::from_secs(5));
        let id = h.queue().await;
        let image = h.registry.get(id).unwrap().image_path.unwrap();

        let held = h.scheduler.gate().acquire().await.unwrap();
        let handle = h.scheduler.submit(id);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.registry.abandon(id);
        drop(held);
        handle.await.unwrap();

        assert_eq!(pipeline.calls(), 0);
        assert!(h.registry.is_empty());
        assert!(!image.exists());
        assert_eq!(h.scheduler.gate().available(), 1);
    }
}
