//! Task registry: the authoritative in-memory map of task id → record.
//!
//! Records are never removed; a cycle reset recreates each one as `Pending`.
//! Iteration order is registration order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::RegistryError;
use crate::task::state::TaskStatus;
use crate::worker::SessionHandle;

/// One managed task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    /// Caller-supplied unique id.
    pub id: String,
    /// Destination parameter handed to the worker, never interpreted here.
    pub target: String,
    pub status: TaskStatus,
    /// Live session, owned by the worker.
    #[serde(skip)]
    pub session: Option<SessionHandle>,
    /// Set once at registration.
    pub created_at: DateTime<Utc>,
    /// Registration sequence, breaks `created_at` ties.
    pub seq: u64,
    /// Set when the task first reaches `WaitingClose`.
    pub completion_wait_start: Option<DateTime<Utc>>,
    /// Last failure, only while in `Error`.
    pub error: Option<String>,
}

impl TaskRecord {
    /// Transition to a new state.
    pub fn transition_to(&mut self, new_status: TaskStatus, reason: &str) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.status, new_status
            ));
        }
        debug!(task_id = %self.id, from = %self.status, to = %new_status, reason, "Task transition");
        self.status = new_status;
        if new_status != TaskStatus::Error {
            self.error = None;
        }
        Ok(())
    }

    /// Whether a session is currently open.
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Preemption ordering key: oldest first.
    pub fn age_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.seq)
    }

    /// Back to a fresh `Pending` record for a new cycle.
    fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.session = None;
        self.completion_wait_start = None;
        self.error = None;
    }
}

/// In-memory task registry.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<TaskRecord>,
    index: HashMap<String, usize>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task as `Pending`.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        target: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<&TaskRecord, RegistryError> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(RegistryError::Duplicate { id });
        }

        let pos = self.tasks.len();
        self.tasks.push(TaskRecord {
            id: id.clone(),
            target: target.into(),
            status: TaskStatus::Pending,
            session: None,
            created_at: now,
            seq: pos as u64,
            completion_wait_start: None,
            error: None,
        });
        self.index.insert(id, pos);
        Ok(&self.tasks[pos])
    }

    pub fn get(&self, id: &str) -> Option<&TaskRecord> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TaskRecord> {
        self.index.get(id).map(|&i| &mut self.tasks[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of tasks in `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Number of tasks holding a session.
    pub fn open_sessions(&self) -> usize {
        self.tasks.iter().filter(|t| t.has_session()).count()
    }

    /// Number of tasks `Mining` with an open session.
    pub fn active_mining(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Mining && t.has_session())
            .count()
    }

    /// Ids of tasks matching `pred`, in registration order.
    pub fn ids_where<F>(&self, pred: F) -> Vec<String>
    where
        F: Fn(&TaskRecord) -> bool,
    {
        self.tasks.iter().filter(|t| pred(t)).map(|t| t.id.clone()).collect()
    }

    /// Detach every open session, returning them for closing.
    pub fn take_sessions(&mut self) -> Vec<(String, SessionHandle)> {
        self.tasks
            .iter_mut()
            .filter_map(|t| t.session.take().map(|s| (t.id.clone(), s)))
            .collect()
    }

    /// Recreate every task as `Pending` with no session.
    pub fn reset_all(&mut self) {
        for task in &mut self.tasks {
            task.reset();
        }
    }
}
