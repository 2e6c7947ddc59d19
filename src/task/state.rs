//! Task state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Registered, waiting for intake.
    Pending,
    /// Session opening or ready and held without a mining slot.
    Initializing,
    /// Actively mining.
    Mining,
    /// Worker reported done.
    Completed,
    /// Done; session kept open until the completion wait elapses.
    WaitingClose,
    /// Session closed for this cycle.
    Closed,
    /// Unrecoverable failure for this cycle.
    Error,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Initializing,
        Self::Mining,
        Self::Completed,
        Self::WaitingClose,
        Self::Closed,
        Self::Error,
    ];

    /// Check if this state allows transitioning to another state.
    ///
    /// Cycle resets bypass this table: every task returns to `Pending`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        if target == Error {
            return !matches!(self, Error);
        }

        matches!(
            (self, target),
            (Pending, Initializing) |
            // Held or ready tasks
            (Initializing, Mining) | (Initializing, Completed) | (Initializing, Closed) |
            (Mining, Completed) | (Mining, Initializing) | (Mining, Closed) |
            (Completed, WaitingClose) |
            (WaitingClose, Closed)
        )
    }

}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Mining => "mining",
            Self::Completed => "completed",
            Self::WaitingClose => "waiting_close",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}
