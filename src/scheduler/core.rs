//! Scheduler implementation.
//!
//! One tick runs these phases in order, each reading what the previous one
//! produced:
//! 1. cycle boundary check (full reset when the hour changed)
//! 2. completion timers (`WaitingClose` → `Closed`)
//! 3. status polling and the transitions it implies
//! 4. preemption pass against ground-truth activity
//! 5. intake of `Pending` tasks
//! 6. starting ready `Initializing` tasks while mining slots remain
//!
//! The scheduler owns the registry and the statistics outright; only the
//! tick mutates them, so none of it needs a lock. A failure while advancing
//! one task moves that task to `Error` and the tick carries on.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::admission::{self, ActiveTask, Usage};
use super::cycle::CycleClock;
use super::report::{StatusReport, Utilization};
use super::stats::CycleStats;
use crate::clock::Clock;
use crate::config::{RetryPolicy, SchedulerConfig};
use crate::error::{RegistryError, WorkerError};
use crate::exec::Backoff;
use crate::task::{TaskRecord, TaskRegistry, TaskStatus};
use crate::worker::{SessionHandle, SessionStatus, SessionWorker};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub cycle_reset: bool,
    pub closed: usize,
    pub failed: usize,
    pub demoted: Vec<String>,
    pub admitted: usize,
    pub started: usize,
}

/// Drives every task through its lifecycle under the configured ceilings.
pub struct Scheduler {
    config: SchedulerConfig,
    worker: Arc<dyn SessionWorker>,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    registry: TaskRegistry,
    stats: CycleStats,
    cycle: CycleClock,
    running: bool,
}

impl Scheduler {
    /// Create a scheduler. The first cycle starts now.
    pub fn new(config: SchedulerConfig, worker: Arc<dyn SessionWorker>, clock: Arc<dyn Clock>) -> Self {
        let cycle = CycleClock::starting_at(clock.now());
        let mut stats = CycleStats::new();
        stats.begin_cycle();
        debug!(?config, "Scheduler::new");
        Self {
            config,
            worker,
            clock,
            backoff: Backoff::new(RetryPolicy::default()),
            registry: TaskRegistry::new(),
            stats,
            cycle,
            running: false,
        }
    }

    /// Retry policy for transient failures of worker calls.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.backoff = Backoff::new(policy);
        self
    }

    /// Register a task as `Pending`.
    pub fn register_task(
        &mut self,
        id: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let task = self.registry.register(id, target, self.clock.now())?;
        debug!(task_id = %task.id, "Task registered");
        Ok(())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current resource usage.
    pub fn usage(&self) -> Usage {
        Usage {
            total_tasks: self.registry.len(),
            open_sessions: self.registry.open_sessions(),
            initializing: self.registry.count(TaskStatus::Initializing),
            active_mining: self.registry.active_mining(),
        }
    }

    /// Run one full tick.
    pub async fn tick(&mut self) -> TickSummary {
        self.running = true;
        let mut summary = TickSummary::default();

        let now = self.clock.now();
        if self.cycle.crossed(now) {
            self.reset_cycle(now).await;
            summary.cycle_reset = true;
        }

        let failed_before = self.stats.cumulative.failed;
        summary.closed = self.process_completion_timers().await;
        self.poll_sessions().await;
        summary.demoted = self.enforce_mining_ceiling().await;
        summary.admitted = self.admit_pending().await;
        summary.started = self.start_ready_tasks(&summary.demoted).await;
        summary.failed = (self.stats.cumulative.failed - failed_before) as usize;

        debug!(?summary, usage = ?self.usage(), "Tick finished");
        summary
    }

    /// Close every session and stop. Close failures are ignored.
    pub async fn shutdown(&mut self) {
        let sessions = self.registry.take_sessions();
        info!(open = sessions.len(), "Scheduler shutting down, closing sessions");

        for (id, session) in sessions {
            if let Err(e) = self.worker.close(&session).await {
                debug!(task_id = %id, error = %e, "Ignoring close failure during shutdown");
            }
            if let Some(task) = self.registry.get_mut(&id) {
                task.status = TaskStatus::Closed;
            }
            self.stats.leave_active(&id);
        }
        self.running = false;
    }

    /// Snapshot for status reporting.
    pub fn status_report(&self) -> StatusReport {
        let mut tasks: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in self.registry.iter() {
            *tasks.entry(task.status).or_insert(0) += 1;
        }

        StatusReport {
            running: self.running,
            cycle: self.stats.cycle,
            tasks,
            mining: Utilization {
                active: self.registry.active_mining(),
                max: self.config.max_active_mining,
            },
            open_pages: Utilization {
                active: self.registry.open_sessions(),
                max: self.config.max_open_pages,
            },
            logging_in: self.stats.logging_in,
            logged_in: self.stats.logged_in,
            cycle_completed: self.stats.cycle_completed,
            cumulative: self.stats.cumulative,
            average_login_secs: self.stats.average_login_secs(),
            average_mining_secs: self.stats.average_mining_secs(),
        }
    }

    // ── Cycle reset ─────────────────────────────────────────────────────

    async fn reset_cycle(&mut self, now: DateTime<Utc>) {
        info!(
            finished_cycle = self.stats.cycle,
            "Cycle boundary crossed, restarting every task"
        );

        for (id, session) in self.registry.take_sessions() {
            if let Err(e) = self.worker.close(&session).await {
                warn!(task_id = %id, error = %e, "Failed to close session during cycle reset");
            }
        }

        self.stats.begin_cycle();
        self.registry.reset_all();
        self.cycle.rearm(now);

        info!(cycle = self.stats.cycle, tasks = self.registry.len(), "New cycle started");
    }

    // ── Completion timers ───────────────────────────────────────────────

    async fn process_completion_timers(&mut self) -> usize {
        let now = self.clock.now();
        let waiting = self.registry.ids_where(|t| t.status == TaskStatus::WaitingClose);
        let mut closed = 0;

        for id in waiting {
            let Some(task) = self.registry.get_mut(&id) else {
                continue;
            };
            let started = match task.completion_wait_start {
                Some(started) => started,
                None => {
                    debug!(task_id = %id, "Waiting task had no completion stamp, starting wait now");
                    *task.completion_wait_start.insert(now)
                }
            };
            let elapsed = (now - started).to_std().unwrap_or_default();
            if elapsed < self.config.completion_wait {
                continue;
            }

            self.release_session(&id).await;
            if self.transition(&id, TaskStatus::Closed, "completion wait elapsed") {
                self.stats.record_closed_after_completion();
                self.stats.leave_active(&id);
                closed += 1;
                info!(task_id = %id, waited_secs = elapsed.as_secs(), "Completed task closed");
            }
        }
        closed
    }

    // ── Status polling ──────────────────────────────────────────────────

    async fn poll_sessions(&mut self) {
        let polled = self.registry.ids_where(|t| {
            t.has_session() && matches!(t.status, TaskStatus::Initializing | TaskStatus::Mining)
        });

        for id in polled {
            let Some(session) = self.session_of(&id) else {
                continue;
            };
            let reported = self
                .with_retry(|| self.worker.poll_status(&session))
                .await;
            match reported {
                Ok(status) => self.apply_report(&id, status).await,
                Err(e) => self.fail_task(&id, format!("status poll failed: {e}")).await,
            }
        }
    }

    async fn apply_report(&mut self, id: &str, reported: SessionStatus) {
        let now = self.clock.now();
        let Some(current) = self.registry.get(id).map(|t| t.status) else {
            return;
        };

        match (current, reported) {
            (_, SessionStatus::Error) => {
                self.fail_task(id, "worker reported session error".to_string()).await;
            }
            (_, SessionStatus::Pending) | (TaskStatus::Mining, SessionStatus::Mining) => {}
            (TaskStatus::Initializing, SessionStatus::Initializing) => {
                if !self.stats.is_ready(id) {
                    info!(task_id = %id, "Task ready");
                }
                self.stats.record_ready(id, now);
            }
            (TaskStatus::Initializing, SessionStatus::Mining) => {
                self.try_promote(id, now);
            }
            (TaskStatus::Mining, SessionStatus::Initializing) => {
                // Worker stopped on its own; the slot is free again
                if self.transition(id, TaskStatus::Initializing, "worker reports idle") {
                    self.stats.clear_mining_start(id);
                }
            }
            (TaskStatus::Initializing, SessionStatus::Completed) if !self.stats.has_mining_start(id) => {
                debug!(task_id = %id, "Ignoring done signal from a task that never mined");
            }
            (TaskStatus::Initializing | TaskStatus::Mining, SessionStatus::Completed) => {
                self.mark_completed(id, now);
            }
            _ => {}
        }
    }

    fn mark_completed(&mut self, id: &str, now: DateTime<Utc>) {
        if !self.transition(id, TaskStatus::Completed, "worker reports done") {
            return;
        }
        self.stats.record_success();

        if let Some(task) = self.registry.get_mut(id) {
            task.completion_wait_start.get_or_insert(now);
        }
        self.transition(id, TaskStatus::WaitingClose, "awaiting completion wait");
        info!(task_id = %id, "Task completed, waiting before close");
    }

    /// Move an `Initializing` task to `Mining` if a slot is free right now.
    fn try_promote(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let active = self.registry.active_mining();
        if !admission::mining_slot_available(active, &self.config) {
            debug!(task_id = %id, active, "No mining slot, holding task");
            return false;
        }
        if self.session_of(id).is_none() {
            return false;
        }
        if !self.transition(id, TaskStatus::Mining, "mining slot granted") {
            return false;
        }
        self.stats.record_mining_started(id, now);
        info!(task_id = %id, active = active + 1, max = self.config.max_active_mining, "Task mining");
        true
    }

    // ── Preemption ──────────────────────────────────────────────────────

    /// Demote the newest ground-truth-active tasks beyond the ceiling.
    ///
    /// Every open session is checked, whatever its cached status says.
    async fn enforce_mining_ceiling(&mut self) -> Vec<String> {
        let candidates: Vec<(String, SessionHandle, ActiveTask)> = self
            .registry
            .iter()
            .filter_map(|t| {
                t.session.clone().map(|s| {
                    let (created_at, seq) = t.age_key();
                    let key = ActiveTask {
                        id: t.id.clone(),
                        created_at,
                        seq,
                    };
                    (t.id.clone(), s, key)
                })
            })
            .collect();

        let mut active = Vec::new();
        for (id, session, key) in candidates {
            match self.with_retry(|| self.worker.confirm_active(&session)).await {
                Ok(true) => active.push(key),
                Ok(false) => {}
                Err(e) => self.fail_task(&id, format!("ground-truth check failed: {e}")).await,
            }
        }

        let confirmed = active.len();
        let victims = admission::preemption_victims(active, self.config.max_active_mining);
        if victims.is_empty() {
            return victims;
        }

        info!(
            confirmed,
            max = self.config.max_active_mining,
            demoting = victims.len(),
            "Active mining ceiling exceeded"
        );
        for id in &victims {
            self.demote(id).await;
        }
        victims
    }

    /// Stop one task's active work.
    ///
    /// A demoted `Initializing`/`Mining` task loses its mining credit and
    /// counts as ready again. A task past completion keeps its status and
    /// credit. An unconfirmed stop closes the task for the cycle.
    async fn demote(&mut self, id: &str) {
        let Some(session) = self.session_of(id) else {
            return;
        };
        let Some(status) = self.registry.get(id).map(|t| t.status) else {
            return;
        };

        let stopped = match self.with_retry(|| self.worker.stop(&session)).await {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!(task_id = %id, error = %e, "Stop request failed");
                false
            }
        };

        let in_workflow = matches!(status, TaskStatus::Initializing | TaskStatus::Mining);
        let reverted = in_workflow && self.stats.revert_mining_start(id);

        if stopped {
            if status == TaskStatus::Mining {
                self.transition(id, TaskStatus::Initializing, "preempted");
            }
            if in_workflow {
                self.stats.record_ready(id, self.clock.now());
            }
            info!(task_id = %id, %status, reverted, "Task preempted");
            return;
        }

        warn!(task_id = %id, %status, "Could not confirm demotion, closing session");
        self.release_session(id).await;
        if self.transition(id, TaskStatus::Closed, "demotion unconfirmed")
            && status == TaskStatus::WaitingClose
        {
            self.stats.record_closed_after_completion();
        }
        self.stats.leave_active(id);
    }

    // ── Intake ──────────────────────────────────────────────────────────

    async fn admit_pending(&mut self) -> usize {
        let slots = admission::intake_slots(&self.usage(), &self.config);
        if slots == 0 {
            return 0;
        }

        let now = self.clock.now();
        let admitted: Vec<String> = self
            .registry
            .ids_where(|t| t.status == TaskStatus::Pending)
            .into_iter()
            .take(slots)
            .collect();
        if admitted.is_empty() {
            return 0;
        }

        let mut opening: Vec<TaskRecord> = Vec::with_capacity(admitted.len());
        for id in &admitted {
            if self.transition(id, TaskStatus::Initializing, "admitted") {
                self.stats.record_opened(id, now);
                if let Some(task) = self.registry.get(id) {
                    opening.push(task.clone());
                }
            }
        }
        info!(count = opening.len(), slots, "Admitting pending tasks");

        let worker = &self.worker;
        let backoff = &self.backoff;
        let opens = opening.iter().map(|task| async move {
            let result = backoff
                .execute(|| worker.open(task), |e: &WorkerError, _| e.is_transient())
                .await;
            (task.id.clone(), result)
        });
        let results = futures::future::join_all(opens).await;

        let mut opened = 0;
        for (id, result) in results {
            match result {
                Ok(session) => {
                    if let Some(task) = self.registry.get_mut(&id) {
                        task.session = Some(session);
                        opened += 1;
                        debug!(task_id = %id, "Session opened");
                    }
                }
                Err(e) => self.fail_task(&id, format!("open failed: {e}")).await,
            }
        }
        opened
    }

    // ── Start ready tasks ───────────────────────────────────────────────

    async fn start_ready_tasks(&mut self, demoted: &[String]) -> usize {
        let demoted: HashSet<&str> = demoted.iter().map(String::as_str).collect();
        let ready = self.registry.ids_where(|t| {
            t.status == TaskStatus::Initializing && t.has_session() && !demoted.contains(t.id.as_str())
        });

        let mut started = 0;
        for id in ready {
            if !self.stats.is_ready(&id) {
                continue;
            }
            if !admission::mining_slot_available(self.registry.active_mining(), &self.config) {
                break;
            }
            let Some(session) = self.session_of(&id) else {
                continue;
            };
            match self.with_retry(|| self.worker.start(&session)).await {
                Ok(true) => {
                    let now = self.clock.now();
                    if self.try_promote(&id, now) {
                        started += 1;
                    }
                }
                Ok(false) => debug!(task_id = %id, "Worker declined start, retrying next tick"),
                Err(e) => self.fail_task(&id, format!("start failed: {e}")).await,
            }
        }
        started
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn session_of(&self, id: &str) -> Option<SessionHandle> {
        self.registry.get(id).and_then(|t| t.session.clone())
    }

    fn transition(&mut self, id: &str, to: TaskStatus, reason: &str) -> bool {
        let Some(task) = self.registry.get_mut(id) else {
            return false;
        };
        match task.transition_to(to, reason) {
            Ok(()) => true,
            Err(e) => {
                warn!(task_id = %id, error = %e, "Rejected transition");
                false
            }
        }
    }

    async fn release_session(&mut self, id: &str) {
        let session = self.registry.get_mut(id).and_then(|t| t.session.take());
        if let Some(session) = session {
            if let Err(e) = self.worker.close(&session).await {
                warn!(task_id = %id, error = %e, "Failed to close session");
            }
        }
    }

    /// Downgrade one task to `Error` and release its session.
    async fn fail_task(&mut self, id: &str, reason: String) {
        warn!(task_id = %id, %reason, "Task failed");
        self.release_session(id).await;
        if self.transition(id, TaskStatus::Error, &reason) {
            if let Some(task) = self.registry.get_mut(id) {
                task.error = Some(reason);
            }
            self.stats.record_failure();
        }
        self.stats.leave_active(id);
    }

    async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T, WorkerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WorkerError>>,
    {
        self.backoff
            .execute(operation, |e: &WorkerError, _| e.is_transient())
            .await
    }
}
