// crates/server-jobs/src/gate.rs
//! GPU admission control.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::GateClosed;

/// Counting gate bounding concurrent inference executions.
///
/// Waiters are served in FIFO order (tokio's semaphore is fair).
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Permission to run one inference. Released when dropped, on every path.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// Create a gate with `capacity` slots. A capacity of zero is raised to
    /// one so the gate can never deadlock every job.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<AdmissionSlot, GateClosed> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateClosed)?;
        Ok(AdmissionSlot { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop admitting work. Pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
