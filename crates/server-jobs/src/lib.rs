// crates/server-jobs/src/lib.rs
//! Job lifecycle for avatar generation.
//!
//! Provides:
//! - `JobRegistry`: id -> job table enforcing the state machine
//! - `AdmissionGate`: bounds concurrent GPU inference
//! - `JobScheduler`: drives each job from `Queued` to a terminal state
//! - `spawn_sweeper`: expires finished async jobs

pub mod error;
pub mod gate;
pub mod registry;
pub mod scheduler;
pub mod sweeper;
pub mod types;

pub use error::{GateClosed, RegistryError};
pub use gate::{AdmissionGate, AdmissionSlot};
pub use registry::JobRegistry;
pub use scheduler::JobScheduler;
pub use sweeper::spawn_sweeper;
pub use types::{Job, JobInputs, JobOrigin, JobSnapshot, Transition};
