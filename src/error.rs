//! Error types for the fleet scheduler.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse task list {path}: {reason}")]
    TaskList { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a session worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Terminal failure: {0}")]
    Terminal(String),

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Operation queue unavailable")]
    QueueClosed,
}

impl WorkerError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<QueueError> for WorkerError {
    fn from(_: QueueError) -> Self {
        Self::QueueClosed
    }
}

/// Task registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Task {id} is already registered")]
    Duplicate { id: String },
}

/// Rate-limited queue errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Operation queue is closed")]
    Closed,

    #[error("Queued operation was dropped before completing")]
    Dropped,
}
