//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Scheduler ceilings and timers. Immutable once the scheduler is built.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum tasks actively mining at once.
    pub max_active_mining: usize,
    /// Maximum sessions open at once.
    pub max_open_pages: usize,
    /// Maximum tasks in `Initializing` at once.
    pub page_open_concurrency: usize,
    /// Delay between the end of one tick and the start of the next.
    pub status_check_interval: Duration,
    /// How long a completed task keeps its session before it is closed.
    pub completion_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_mining: 5,
            max_open_pages: 10,
            page_open_concurrency: 3,
            status_check_interval: Duration::from_millis(5_000),
            completion_wait: Duration::from_millis(30_000),
        }
    }
}

/// Retry policy for the backoff executor.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
        }
    }
}

/// Rate-limited queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Minimum spacing between the starts of two consecutive operations.
    pub min_interval: Duration,
    /// Retry policy applied to every queued operation.
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1_000),
            retry: RetryPolicy::default(),
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    /// JSON file holding the task list.
    pub tasks_file: PathBuf,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            tasks_file: PathBuf::from("./tasks.json"),
        }
    }
}

impl FleetConfig {
    /// Build configuration from `FLEET_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let sched = &mut config.scheduler;

        if let Some(v) = parse_var::<usize>(&lookup, "FLEET_MAX_ACTIVE_MINING")? {
            sched.max_active_mining = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "FLEET_MAX_OPEN_PAGES")? {
            sched.max_open_pages = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "FLEET_PAGE_OPEN_CONCURRENCY")? {
            sched.page_open_concurrency = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "FLEET_STATUS_CHECK_INTERVAL_MS")? {
            sched.status_check_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "FLEET_COMPLETION_WAIT_MS")? {
            sched.completion_wait = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "FLEET_QUEUE_MIN_INTERVAL_MS")? {
            config.queue.min_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u32>(&lookup, "FLEET_QUEUE_MAX_RETRIES")? {
            config.queue.retry.max_retries = v;
        }
        if let Some(path) = lookup("FLEET_TASKS_FILE") {
            config.tasks_file = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        for (key, value) in [
            ("max_active_mining", s.max_active_mining),
            ("max_open_pages", s.max_open_pages),
            ("page_open_concurrency", s.page_open_concurrency),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be at least 1"));
            }
        }
        if s.status_check_interval.is_zero() {
            return Err(invalid("status_check_interval", "must be non-zero"));
        }

        let retry = &self.queue.retry;
        if retry.max_delay < retry.initial_delay {
            return Err(invalid("max_delay", "must not be below initial_delay"));
        }
        if !(retry.backoff_multiplier >= 1.0) {
            return Err(invalid("backoff_multiplier", "must be at least 1.0"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &format!("'{raw}': {e}"))),
    }
}

/// One entry of the task list file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub target: String,
}

/// Load a JSON array of `{ "id", "target" }` entries.
pub fn load_task_list(path: &Path) -> Result<Vec<TaskEntry>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::TaskList {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
