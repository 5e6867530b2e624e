// crates/server-jobs/src/registry.rs
//! In-memory job table and its state machine.

use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use iavatar_types::{ErrorKind, GenerationOptions, JobError, JobId, JobState};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::RegistryError;
use crate::types::{Job, JobInputs, JobOrigin, JobSnapshot, Transition};

struct Entry {
    job: Job,
    state_tx: watch::Sender<JobState>,
}

/// Thread-safe mapping from job id to job record.
///
/// Backed by a sharded map, so every operation on one job is serialized by
/// that entry's shard lock while unrelated jobs proceed in parallel. No lock
/// is ever held across an `.await`.
pub struct JobRegistry {
    jobs: DashMap<JobId, Entry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    /// Register a new job in `Queued`.
    ///
    /// The id is generated by the caller (`JobId::new()`) before staging so
    /// the staged file names can carry it.
    pub fn create(
        &self,
        id: JobId,
        params: GenerationOptions,
        inputs: JobInputs,
        origin: JobOrigin,
    ) -> Result<JobId, RegistryError> {
        match self.jobs.entry(id) {
            MapEntry::Occupied(_) => Err(RegistryError::Duplicate { id }),
            MapEntry::Vacant(slot) => {
                let (state_tx, _) = watch::channel(JobState::Queued);
                slot.insert(Entry {
                    job: Job::new(id, params, inputs, origin),
                    state_tx,
                });
                tracing::debug!(job_id = %id, origin = ?origin, "Job queued");
                Ok(id)
            }
        }
    }

    /// Apply a state transition, enforcing `Queued -> Processing ->
    /// {Completed, Failed}`. A rejected `Complete` drops its output file.
    ///
    /// Starting a job whose owner has abandoned it removes the job instead
    /// and returns [`RegistryError::Abandoned`]. Staged files released here
    /// are deleted only after the shard lock is released.
    pub fn transition(&self, id: JobId, transition: Transition) -> Result<JobState, RegistryError> {
        let to = transition.target();
        let outcome = {
            let Some(mut entry) = self.jobs.get_mut(&id) else {
                return Err(RegistryError::NotFound(id));
            };
            let from = entry.job.state;
            if !from.can_transition_to(to) {
                Err((transition, RegistryError::InvalidTransition { id, from, to }))
            } else if entry.job.abandoned && to == JobState::Processing {
                Err((transition, RegistryError::Abandoned(id)))
            } else {
                let job = &mut entry.job;
                match transition {
                    Transition::Start => {}
                    Transition::Complete(output) => {
                        debug_assert!(job.output.is_none(), "output is write-once");
                        job.output = Some(Arc::new(output));
                    }
                    Transition::Fail(error) => job.error = Some(error),
                }
                let released = job.enter(to);
                let discard = job.abandoned && to.is_terminal();
                entry.state_tx.send_replace(to);
                Ok((released, discard))
            }
        };

        match outcome {
            Ok((released, discard)) => {
                drop(released);
                if discard {
                    self.jobs.remove(&id);
                    tracing::debug!(job_id = %id, "Discarded abandoned job result");
                }
                Ok(to)
            }
            Err((rejected, err)) => {
                drop(rejected);
                if let RegistryError::Abandoned(_) = err {
                    self.jobs
                        .remove_if(&id, |_, e| e.job.abandoned && e.job.state == JobState::Queued);
                    tracing::info!(job_id = %id, "Abandoned job removed before inference");
                }
                Err(err)
            }
        }
    }

    /// Force a non-terminal job into `Failed` with `InternalError`.
    ///
    /// Only for invariant breaches detected by the scheduler. A `Queued` job
    /// passes through `Processing` first so its history keeps the usual
    /// order. Returns false if the job is gone or already terminal.
    pub fn fail_internal(&self, id: JobId, message: impl Into<String>) -> bool {
        let (released, discard) = {
            let Some(mut entry) = self.jobs.get_mut(&id) else {
                return false;
            };
            if entry.job.state.is_terminal() {
                return false;
            }
            if entry.job.state == JobState::Queued {
                let _ = entry.job.enter(JobState::Processing);
            }
            entry.job.error = Some(JobError::new(ErrorKind::InternalError, message));
            let released = entry.job.enter(JobState::Failed);
            entry.state_tx.send_replace(JobState::Failed);
            (released, entry.job.abandoned)
        };
        drop(released);
        if discard {
            self.jobs.remove(&id);
        }
        true
    }

    pub fn get(&self, id: JobId) -> Result<JobSnapshot, RegistryError> {
        self.jobs
            .get(&id)
            .map(|e| e.job.snapshot())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Watch a job's state. The sender closes when the job leaves the
    /// registry.
    pub fn subscribe(&self, id: JobId) -> Result<watch::Receiver<JobState>, RegistryError> {
        self.jobs
            .get(&id)
            .map(|e| e.state_tx.subscribe())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Remove a terminal job and hand its record to the caller, moving
    /// ownership of the output with it.
    pub fn take(&self, id: JobId) -> Result<Job, RegistryError> {
        if let Some((_, entry)) = self.jobs.remove_if(&id, |_, e| e.job.state.is_terminal()) {
            return Ok(entry.job);
        }
        match self.jobs.get(&id) {
            Some(e) => Err(RegistryError::NotTerminal {
                id,
                state: e.job.state,
            }),
            None => Err(RegistryError::NotFound(id)),
        }
    }

    /// The owner of a job went away. A terminal job is removed now; a
    /// running one finishes and is removed on reaching a terminal state.
    pub fn abandon(&self, id: JobId) {
        let terminal = match self.jobs.get_mut(&id) {
            Some(mut entry) => {
                if entry.job.state.is_terminal() {
                    true
                } else {
                    entry.job.abandoned = true;
                    false
                }
            }
            None => return,
        };
        if terminal {
            self.jobs.remove(&id);
        } else {
            tracing::info!(job_id = %id, "Job abandoned by caller; result will be discarded");
        }
    }

    /// Remove async jobs that have been terminal for longer than `ttl`,
    /// deleting their staged files. Returns how many were removed.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(ttl);
        let expired = |e: &Entry| {
            e.job.origin == JobOrigin::Async
                && e.job.state.is_terminal()
                && match (e.job.completed_at, cutoff) {
                    (Some(done), Some(cutoff)) => done <= cutoff,
                    _ => false,
                }
        };

        let candidates: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|r| expired(r.value()))
            .map(|r| *r.key())
            .collect();

        // Removed entries drop (and delete files) after the shard lock is
        // released.
        let removed: Vec<_> = candidates
            .into_iter()
            .filter_map(|id| self.jobs.remove_if(&id, |_, e| expired(e)))
            .collect();
        removed.len()
    }

    pub fn count_in(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|r| r.job.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iavatar_core::{Owner, StagedKind, StagingStore};
    use pretty_assertions::assert_eq;

    async fn inputs(store: &StagingStore, id: JobId) -> JobInputs {
        JobInputs {
            image: store.stage(id, StagedKind::Image, "png", b"img").await.unwrap(),
            audio: store.stage(id, StagedKind::Audio, "wav", b"wav").await.unwrap(),
        }
    }

    async fn setup() -> (tempfile::TempDir, StagingStore, JobRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::open(dir.path()).unwrap();
        (dir, store, JobRegistry::new())
    }

    fn output(store: &StagingStore, id: JobId) -> iavatar_core::StagedFile {
        let path = store.output_path(id);
        std::fs::write(&path, b"mp4").unwrap();
        store.adopt(Owner::Job(id), path)
    }

    #[tokio::test]
    async fn test_create_starts_queued() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Async)
            .unwrap();

        let snap = registry.get(id).unwrap();
        assert_eq!(snap.state, JobState::Queued);
        assert_eq!(snap.history, vec![JobState::Queued]);
        assert!(snap.output.is_none());
        assert!(snap.image_path.unwrap().exists());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_full_lifecycle_releases_inputs() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Async)
            .unwrap();
        let image = registry.get(id).unwrap().image_path.unwrap();

        registry.transition(id, Transition::Start).unwrap();
        let snap = registry.get(id).unwrap();
        assert_eq!(snap.state, JobState::Processing);
        assert!(snap.started_at.is_some());

        registry
            .transition(id, Transition::Complete(output(&store, id)))
            .unwrap();
        let snap = registry.get(id).unwrap();
        assert_eq!(
            snap.history,
            vec![JobState::Queued, JobState::Processing, JobState::Completed]
        );
        assert!(snap.completed_at.is_some());
        assert!(snap.output_path().unwrap().exists());
        assert!(!image.exists(), "inputs must be deleted once terminal");
    }

    #[tokio::test]
    async fn test_rejects_skipping_processing() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Async)
            .unwrap();

        let late = output(&store, id);
        let late_path = late.path().to_path_buf();
        let err = registry.transition(id, Transition::Complete(late)).unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidTransition {
                id,
                from: JobState::Queued,
                to: JobState::Completed
            }
        );
        assert!(!late_path.exists(), "rejected output is discarded");
        assert_eq!(registry.get(id).unwrap().state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_terminal_state_is_immutable() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Async)
            .unwrap();
        registry.transition(id, Transition::Start).unwrap();
        registry
            .transition(id, Transition::Fail(JobError::new(ErrorKind::TimeoutError, "slow")))
            .unwrap();

        let late = output(&store, id);
        let late_path = late.path().to_path_buf();
        assert!(matches!(
            registry.transition(id, Transition::Complete(late)),
            Err(RegistryError::InvalidTransition { .. })
        ));
        assert!(matches!(
            registry.transition(id, Transition::Start),
            Err(RegistryError::InvalidTransition { .. })
        ));
        assert!(!late_path.exists());

        let snap = registry.get(id).unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(snap.error.unwrap().error_kind, ErrorKind::TimeoutError);
        assert!(!registry.fail_internal(id, "again"));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let registry = JobRegistry::new();
        let id = JobId::new();
        assert_eq!(registry.get(id).unwrap_err(), RegistryError::NotFound(id));
        assert_eq!(
            registry.transition(id, Transition::Start).unwrap_err(),
            RegistryError::NotFound(id)
        );
        assert!(registry.subscribe(id).is_err());
        registry.abandon(id);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Async)
            .unwrap();
        let err = registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Async)
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate { id });
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Sync)
            .unwrap();
        let mut rx = registry.subscribe(id).unwrap();
        assert_eq!(*rx.borrow(), JobState::Queued);

        registry.transition(id, Transition::Start).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), JobState::Processing);
    }

    #[tokio::test]
    async fn test_take_requires_terminal() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Sync)
            .unwrap();
        assert_eq!(
            registry.take(id).unwrap_err(),
            RegistryError::NotTerminal {
                id,
                state: JobState::Queued
            }
        );

        registry.transition(id, Transition::Start).unwrap();
        registry
            .transition(id, Transition::Complete(output(&store, id)))
            .unwrap();
        let job = registry.take(id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.output.as_ref().unwrap().path().exists());
        assert!(registry.is_empty());

        let path = job.output.as_ref().unwrap().path().to_path_buf();
        drop(job);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_abandon_running_job_discards_on_completion() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Sync)
            .unwrap();
        registry.transition(id, Transition::Start).unwrap();

        registry.abandon(id);
        assert_eq!(registry.len(), 1, "running job stays until terminal");

        let out = output(&store, id);
        let out_path = out.path().to_path_buf();
        registry.transition(id, Transition::Complete(out)).unwrap();
        assert!(registry.is_empty());
        assert!(!out_path.exists());
    }

    #[tokio::test]
    async fn test_abandon_terminal_job_removes_now() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Sync)
            .unwrap();
        registry.transition(id, Transition::Start).unwrap();
        registry
            .transition(id, Transition::Fail(JobError::new(ErrorKind::PipelineError, "x")))
            .unwrap();
        registry.abandon(id);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_fail_internal() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Async)
            .unwrap();
        registry.transition(id, Transition::Start).unwrap();

        assert!(registry.fail_internal(id, "scheduler bug"));
        let snap = registry.get(id).unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(snap.error.unwrap().error_kind, ErrorKind::InternalError);
    }

    #[tokio::test]
    async fn test_fail_internal_on_queued_job_keeps_history_order() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Async)
            .unwrap();
        let image = registry.get(id).unwrap().image_path.unwrap();

        assert!(registry.fail_internal(id, "lost"));
        let snap = registry.get(id).unwrap();
        assert_eq!(
            snap.history,
            vec![JobState::Queued, JobState::Processing, JobState::Failed]
        );
        assert!(snap.started_at.is_some());
        assert!(!image.exists());
    }

    #[tokio::test]
    async fn test_start_of_abandoned_queued_job_removes_it() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Sync)
            .unwrap();
        let image = registry.get(id).unwrap().image_path.unwrap();

        registry.abandon(id);
        assert_eq!(registry.len(), 1, "queued job is only flagged");

        assert_eq!(
            registry.transition(id, Transition::Start).unwrap_err(),
            RegistryError::Abandoned(id)
        );
        assert!(registry.is_empty());
        assert!(!image.exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_async_jobs_only() {
        let (_dir, store, registry) = setup().await;

        let done = JobId::new();
        registry
            .create(done, GenerationOptions::default(), inputs(&store, done).await, JobOrigin::Async)
            .unwrap();
        registry.transition(done, Transition::Start).unwrap();
        registry
            .transition(done, Transition::Complete(output(&store, done)))
            .unwrap();
        let out_path = registry.get(done).unwrap().output_path().unwrap().to_path_buf();

        let pending = JobId::new();
        registry
            .create(pending, GenerationOptions::default(), inputs(&store, pending).await, JobOrigin::Async)
            .unwrap();

        let waiting = JobId::new();
        registry
            .create(waiting, GenerationOptions::default(), inputs(&store, waiting).await, JobOrigin::Sync)
            .unwrap();
        registry.transition(waiting, Transition::Start).unwrap();
        registry
            .transition(waiting, Transition::Fail(JobError::new(ErrorKind::PipelineError, "x")))
            .unwrap();

        assert_eq!(registry.sweep(Duration::from_secs(3600)), 0);
        assert_eq!(registry.sweep(Duration::ZERO), 1);

        assert_eq!(registry.get(done).unwrap_err(), RegistryError::NotFound(done));
        assert!(!out_path.exists());
        assert!(registry.get(pending).is_ok());
        assert!(registry.get(waiting).is_ok());
    }

    #[tokio::test]
    async fn test_reader_lease_outlives_sweep() {
        let (_dir, store, registry) = setup().await;
        let id = JobId::new();
        registry
            .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Async)
            .unwrap();
        registry.transition(id, Transition::Start).unwrap();
        registry
            .transition(id, Transition::Complete(output(&store, id)))
            .unwrap();

        let snap = registry.get(id).unwrap();
        assert_eq!(registry.sweep(Duration::ZERO), 1);
        let path = snap.output_path().unwrap().to_path_buf();
        assert!(path.exists(), "in-flight reader keeps the file");
        drop(snap);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_count_in() {
        let (_dir, store, registry) = setup().await;
        for _ in 0..3 {
            let id = JobId::new();
            registry
                .create(id, GenerationOptions::default(), inputs(&store, id).await, JobOrigin::Async)
                .unwrap();
        }
        assert_eq!(registry.count_in(JobState::Queued), 3);
        assert_eq!(registry.count_in(JobState::Processing), 0);
    }
}
