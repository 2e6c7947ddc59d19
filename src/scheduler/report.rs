//! Status report exposed to callers after every tick.

use std::collections::BTreeMap;

use serde::Serialize;

use super::stats::CumulativeStats;
use crate::task::TaskStatus;

/// Used/limit pair for one ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Utilization {
    pub active: usize,
    pub max: usize,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub cycle: u64,
    pub tasks: BTreeMap<TaskStatus, usize>,
    pub mining: Utilization,
    pub open_pages: Utilization,
    pub logging_in: u64,
    pub logged_in: u64,
    pub cycle_completed: u64,
    pub cumulative: CumulativeStats,
    pub average_login_secs: Option<f64>,
    pub average_mining_secs: Option<f64>,
}

impl StatusReport {
    /// Count of tasks in `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.get(&status).copied().unwrap_or(0)
    }
}
