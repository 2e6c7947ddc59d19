//! Cycle statistics.
//!
//! Cumulative counters live for the whole process. Per-cycle gauges and the
//! timing map are wiped by every cycle reset. Timing samples are kept
//! forever.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Timestamps used to derive timing samples for one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TaskTiming {
    opened_at: Option<DateTime<Utc>>,
    ready_at: Option<DateTime<Utc>>,
    mining_started_at: Option<DateTime<Utc>>,
}

/// Counters that survive cycle resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CumulativeStats {
    pub total_completed: u64,
    pub success: u64,
    pub failed: u64,
    pub mining_started: u64,
}

/// Scheduler statistics, owned by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub cycle: u64,
    pub cumulative: CumulativeStats,
    /// Admitted tasks not yet ready.
    pub logging_in: u64,
    /// Ready tasks not mining.
    pub logged_in: u64,
    pub cycle_completed: u64,
    /// Open → ready, seconds.
    pub login_times: Vec<f64>,
    /// Open → mining start, seconds.
    pub mining_times: Vec<f64>,
    timings: HashMap<String, TaskTiming>,
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 1000.0
}

fn average(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

impl CycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the task has a recorded mining start this cycle.
    pub fn has_mining_start(&self, task_id: &str) -> bool {
        self.timings
            .get(task_id)
            .is_some_and(|t| t.mining_started_at.is_some())
    }

    /// Whether the task has reported ready this cycle.
    pub fn is_ready(&self, task_id: &str) -> bool {
        self.timings.get(task_id).is_some_and(|t| t.ready_at.is_some())
    }

    /// Task admitted and its session is being opened.
    pub fn record_opened(&mut self, task_id: &str, at: DateTime<Utc>) {
        self.timings.insert(
            task_id.to_string(),
            TaskTiming {
                opened_at: Some(at),
                ..Default::default()
            },
        );
        self.logging_in += 1;
    }

    /// First ready report of the cycle. Later calls are ignored.
    pub fn record_ready(&mut self, task_id: &str, at: DateTime<Utc>) {
        let timing = self.timings.entry(task_id.to_string()).or_default();
        if timing.ready_at.is_some() {
            return;
        }
        timing.ready_at = Some(at);
        if let Some(opened) = timing.opened_at {
            self.login_times.push(seconds_between(opened, at));
            self.logging_in = self.logging_in.saturating_sub(1);
        }
        self.logged_in += 1;
    }

    /// Task entered `Mining`.
    pub fn record_mining_started(&mut self, task_id: &str, at: DateTime<Utc>) {
        self.record_ready(task_id, at);
        let timing = self.timings.entry(task_id.to_string()).or_default();
        if timing.mining_started_at.is_some() {
            return;
        }
        timing.mining_started_at = Some(at);
        if let Some(opened) = timing.opened_at {
            self.mining_times.push(seconds_between(opened, at));
        }
        self.logged_in = self.logged_in.saturating_sub(1);
        self.cumulative.mining_started += 1;
    }

    /// Task stopped mining but stays open; it counts as ready again.
    /// Returns whether a mining start was recorded.
    pub fn clear_mining_start(&mut self, task_id: &str) -> bool {
        let Some(timing) = self.timings.get_mut(task_id) else {
            return false;
        };
        if timing.mining_started_at.take().is_none() {
            return false;
        }
        self.logged_in += 1;
        true
    }

    /// Undo a mining start after preemption, including its cumulative
    /// credit. Returns whether there was one to undo.
    pub fn revert_mining_start(&mut self, task_id: &str) -> bool {
        if !self.clear_mining_start(task_id) {
            return false;
        }
        self.cumulative.mining_started = self.cumulative.mining_started.saturating_sub(1);
        true
    }

    /// Task reported done.
    pub fn record_success(&mut self) {
        self.cumulative.success += 1;
    }

    /// Task failed terminally.
    pub fn record_failure(&mut self) {
        self.cumulative.failed += 1;
    }

    /// Task closed after its completion wait.
    pub fn record_closed_after_completion(&mut self) {
        self.cumulative.total_completed += 1;
        self.cycle_completed += 1;
    }

    /// Task left the active set; drop its timing entry and whatever gauge
    /// it was still counted in.
    pub fn leave_active(&mut self, task_id: &str) {
        let Some(timing) = self.timings.remove(task_id) else {
            return;
        };
        if timing.ready_at.is_none() {
            if timing.opened_at.is_some() {
                self.logging_in = self.logging_in.saturating_sub(1);
            }
        } else if timing.mining_started_at.is_none() {
            self.logged_in = self.logged_in.saturating_sub(1);
        }
    }

    /// Start a new cycle: zero per-cycle gauges, clear timings.
    pub fn begin_cycle(&mut self) {
        self.cycle += 1;
        self.logging_in = 0;
        self.logged_in = 0;
        self.cycle_completed = 0;
        self.timings.clear();
    }

    pub fn tracked_tasks(&self) -> usize {
        self.timings.len()
    }

    pub fn average_login_secs(&self) -> Option<f64> {
        average(&self.login_times)
    }

    pub fn average_mining_secs(&self) -> Option<f64> {
        average(&self.mining_times)
    }
}
