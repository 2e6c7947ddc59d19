//! Admission-control arithmetic: intake slots and preemption victims.

use chrono::{DateTime, Utc};

use crate::config::SchedulerConfig;

/// Resource usage snapshot taken at the start of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub total_tasks: usize,
    pub open_sessions: usize,
    pub initializing: usize,
    pub active_mining: usize,
}

/// How many `Pending` tasks may be admitted right now.
///
/// Bounded by the open-page ceiling, the page-open concurrency, and the
/// number of tasks without a session.
pub fn intake_slots(usage: &Usage, config: &SchedulerConfig) -> usize {
    let by_total = usage.total_tasks.saturating_sub(usage.open_sessions);
    let by_pages = config.max_open_pages.saturating_sub(usage.open_sessions);
    let by_concurrency = config.page_open_concurrency.saturating_sub(usage.initializing);
    by_total.min(by_pages).min(by_concurrency)
}

/// Whether one more task may enter `Mining`.
pub fn mining_slot_available(active_mining: usize, config: &SchedulerConfig) -> bool {
    active_mining < config.max_active_mining
}

/// A task confirmed to be actively mining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTask {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub seq: u64,
}

/// Pick the tasks to demote so at most `max_active` stay active.
///
/// Oldest tasks keep their slot; everything past index `max_active` in
/// ascending creation order is returned, newest last.
pub fn preemption_victims(mut active: Vec<ActiveTask>, max_active: usize) -> Vec<String> {
    if active.len() <= max_active {
        return Vec::new();
    }
    active.sort_by(|a, b| (a.created_at, a.seq).cmp(&(b.created_at, b.seq)));
    active.into_iter().skip(max_active).map(|t| t.id).collect()
}
