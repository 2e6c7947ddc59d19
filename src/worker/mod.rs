//! Session worker: the external collaborator that drives one remote session.
//!
//! The scheduler never looks inside a session; it only holds the opaque
//! [`SessionHandle`] and talks to the worker through [`SessionWorker`].

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::task::TaskRecord;

pub use simulated::{SimulatedWorker, SimulationProfile};

/// Opaque handle to a live session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    id: Uuid,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Status snapshot reported by the worker for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Still loading, no usable signal yet.
    Pending,
    /// Ready, not doing active work.
    Initializing,
    /// Doing active work.
    Mining,
    /// Work finished.
    Completed,
    /// The session failed and cannot recover.
    Error,
}

/// Drives remote sessions on behalf of the scheduler.
#[async_trait]
pub trait SessionWorker: Send + Sync {
    /// Open a session and bring it to the ready state without starting work.
    async fn open(&self, task: &TaskRecord) -> Result<SessionHandle, WorkerError>;

    /// Best-effort status snapshot. Must have no side effects.
    async fn poll_status(&self, session: &SessionHandle) -> Result<SessionStatus, WorkerError>;

    /// Ground-truth check for active work, independent of `poll_status`.
    async fn confirm_active(&self, session: &SessionHandle) -> Result<bool, WorkerError>;

    /// Request active work. Idempotent.
    async fn start(&self, session: &SessionHandle) -> Result<bool, WorkerError>;

    /// Request a stop of active work. Idempotent and reversible.
    async fn stop(&self, session: &SessionHandle) -> Result<bool, WorkerError>;

    /// Release all resources. Safe to call more than once.
    async fn close(&self, session: &SessionHandle) -> Result<(), WorkerError>;
}
