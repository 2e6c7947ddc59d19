//! Scenario tests for the scheduler tick.
//!
//! A scripted worker stands in for the real session driver: each test sets
//! what every session reports and the scheduler is ticked by hand against a
//! manual clock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use fleet_scheduler::clock::{Clock, ManualClock};
use fleet_scheduler::config::{RetryPolicy, SchedulerConfig};
use fleet_scheduler::error::WorkerError;
use fleet_scheduler::scheduler::{Scheduler, spawn_scheduler_loop};
use fleet_scheduler::task::{TaskRecord, TaskStatus};
use fleet_scheduler::worker::{SessionHandle, SessionStatus, SessionWorker};

#[derive(Default)]
struct Script {
    sessions: HashMap<SessionHandle, String>,
    status: HashMap<String, SessionStatus>,
    active: HashMap<String, bool>,
    refuse_stop: HashSet<String>,
    fail_open: HashSet<String>,
    close_fails: bool,
    opened: Vec<String>,
    closed: Vec<String>,
    stopped: Vec<String>,
}

/// Worker whose sessions report whatever the test scripts.
#[derive(Default)]
struct ScriptedWorker {
    script: Mutex<Script>,
}

impl ScriptedWorker {
    fn set_status(&self, target: &str, status: SessionStatus) {
        let mut s = self.script.lock().unwrap();
        s.status.insert(target.to_string(), status);
        s.active.remove(target);
    }

    fn set_all(&self, targets: &[&str], status: SessionStatus) {
        for t in targets {
            self.set_status(t, status);
        }
    }

    /// Override the ground truth independently of the reported status.
    fn set_active(&self, target: &str, active: bool) {
        self.script.lock().unwrap().active.insert(target.to_string(), active);
    }

    fn refuse_stop(&self, target: &str) {
        self.script.lock().unwrap().refuse_stop.insert(target.to_string());
    }

    fn fail_open(&self, target: &str) {
        self.script.lock().unwrap().fail_open.insert(target.to_string());
    }

    fn set_close_fails(&self, fails: bool) {
        self.script.lock().unwrap().close_fails = fails;
    }

    fn closed(&self) -> Vec<String> {
        self.script.lock().unwrap().closed.clone()
    }

    fn stopped(&self) -> Vec<String> {
        self.script.lock().unwrap().stopped.clone()
    }

    fn opened(&self) -> Vec<String> {
        self.script.lock().unwrap().opened.clone()
    }

    fn live_sessions(&self) -> usize {
        self.script.lock().unwrap().sessions.len()
    }

    fn target_of(s: &Script, session: &SessionHandle) -> Result<String, WorkerError> {
        s.sessions
            .get(session)
            .cloned()
            .ok_or_else(|| WorkerError::SessionNotFound(session.to_string()))
    }
}

#[async_trait]
impl SessionWorker for ScriptedWorker {
    async fn open(&self, task: &TaskRecord) -> Result<SessionHandle, WorkerError> {
        let mut s = self.script.lock().unwrap();
        if s.fail_open.contains(&task.target) {
            return Err(WorkerError::Terminal("login rejected".into()));
        }
        let handle = SessionHandle::new();
        s.sessions.insert(handle.clone(), task.target.clone());
        s.opened.push(task.target.clone());
        Ok(handle)
    }

    async fn poll_status(&self, session: &SessionHandle) -> Result<SessionStatus, WorkerError> {
        let s = self.script.lock().unwrap();
        let target = Self::target_of(&s, session)?;
        Ok(s.status.get(&target).copied().unwrap_or(SessionStatus::Pending))
    }

    async fn confirm_active(&self, session: &SessionHandle) -> Result<bool, WorkerError> {
        let s = self.script.lock().unwrap();
        let target = Self::target_of(&s, session)?;
        Ok(s.active
            .get(&target)
            .copied()
            .unwrap_or(s.status.get(&target) == Some(&SessionStatus::Mining)))
    }

    async fn start(&self, session: &SessionHandle) -> Result<bool, WorkerError> {
        let mut s = self.script.lock().unwrap();
        let target = Self::target_of(&s, session)?;
        match s.status.get(&target) {
            Some(SessionStatus::Initializing) | Some(SessionStatus::Mining) => {
                s.status.insert(target.clone(), SessionStatus::Mining);
                s.active.remove(&target);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stop(&self, session: &SessionHandle) -> Result<bool, WorkerError> {
        let mut s = self.script.lock().unwrap();
        let target = Self::target_of(&s, session)?;
        s.stopped.push(target.clone());
        if s.refuse_stop.contains(&target) {
            return Ok(false);
        }
        s.status.insert(target.clone(), SessionStatus::Initializing);
        s.active.insert(target, false);
        Ok(true)
    }

    async fn close(&self, session: &SessionHandle) -> Result<(), WorkerError> {
        let mut s = self.script.lock().unwrap();
        if let Some(target) = s.sessions.remove(session) {
            s.closed.push(target);
        }
        if s.close_fails {
            return Err(WorkerError::Terminal("browser crashed".into()));
        }
        Ok(())
    }
}

struct Harness {
    scheduler: Scheduler,
    worker: Arc<ScriptedWorker>,
    clock: ManualClock,
}

fn harness(config: SchedulerConfig, ids: &[&str]) -> Harness {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap());
    let worker = Arc::new(ScriptedWorker::default());
    let mut scheduler = Scheduler::new(config, worker.clone(), Arc::new(clock.clone()))
        .with_retry_policy(RetryPolicy {
            max_retries: 0,
            ..Default::default()
        });
    for id in ids {
        scheduler.register_task(*id, *id).unwrap();
    }
    Harness {
        scheduler,
        worker,
        clock,
    }
}

fn config(mining: usize, pages: usize, concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_active_mining: mining,
        max_open_pages: pages,
        page_open_concurrency: concurrency,
        status_check_interval: Duration::from_millis(100),
        completion_wait: Duration::from_secs(30),
    }
}

fn status(h: &Harness, id: &str) -> TaskStatus {
    h.scheduler.registry().get(id).unwrap().status
}

/// Bring `id` to `Mining` in a single-task fleet.
async fn mine_single(h: &mut Harness, id: &str) {
    h.scheduler.tick().await;
    h.worker.set_status(id, SessionStatus::Initializing);
    h.scheduler.tick().await;
    assert_eq!(status(h, id), TaskStatus::Mining);
}

#[tokio::test]
async fn end_to_end_three_tasks_newest_held() {
    let mut h = harness(config(2, 3, 3), &["a", "b", "c"]);

    let first = h.scheduler.tick().await;
    assert_eq!(first.admitted, 3);
    for id in ["a", "b", "c"] {
        assert_eq!(status(&h, id), TaskStatus::Initializing);
    }

    h.worker.set_all(&["a", "b", "c"], SessionStatus::Mining);
    let second = h.scheduler.tick().await;

    assert_eq!(status(&h, "a"), TaskStatus::Mining);
    assert_eq!(status(&h, "b"), TaskStatus::Mining);
    assert_eq!(status(&h, "c"), TaskStatus::Initializing);
    assert_eq!(second.demoted, vec!["c".to_string()]);
    assert_eq!(h.worker.stopped(), vec!["c".to_string()]);
    assert_eq!(h.scheduler.stats().cumulative.mining_started, 2);
    assert_eq!(h.scheduler.registry().active_mining(), 2);

    // stopped c counts as ready, not as still logging in
    let stats = h.scheduler.stats();
    assert_eq!((stats.logging_in, stats.logged_in), (0, 1));
    assert!(stats.is_ready("c"));
}

#[tokio::test]
async fn demoted_task_restarts_once_a_slot_frees() {
    let mut h = harness(config(2, 3, 3), &["a", "b", "c"]);
    h.scheduler.tick().await;
    h.worker.set_all(&["a", "b", "c"], SessionStatus::Mining);
    h.scheduler.tick().await;
    assert_eq!(status(&h, "c"), TaskStatus::Initializing);

    h.worker.set_status("a", SessionStatus::Error);
    let summary = h.scheduler.tick().await;

    assert_eq!(status(&h, "a"), TaskStatus::Error);
    assert_eq!(summary.started, 1);
    assert_eq!(status(&h, "c"), TaskStatus::Mining);
    assert_eq!(h.scheduler.stats().cumulative.mining_started, 3);
}

/// Bring `a` to `WaitingClose` while `b` and `c` mine. `a` is the newest.
async fn completed_newest_with_two_miners() -> Harness {
    let mut h = harness(config(2, 3, 3), &["b", "c", "a"]);
    h.scheduler.tick().await;
    h.worker.set_status("a", SessionStatus::Initializing);
    h.scheduler.tick().await;
    assert_eq!(status(&h, "a"), TaskStatus::Mining);

    h.worker.set_status("a", SessionStatus::Completed);
    h.worker.set_all(&["b", "c"], SessionStatus::Initializing);
    h.scheduler.tick().await;
    assert_eq!(status(&h, "a"), TaskStatus::WaitingClose);
    assert_eq!(status(&h, "b"), TaskStatus::Mining);
    assert_eq!(status(&h, "c"), TaskStatus::Mining);

    // a's page kept working after it reported done
    h.worker.set_active("a", true);
    h
}

#[tokio::test]
async fn ceiling_counts_sessions_past_completion() {
    let mut h = completed_newest_with_two_miners().await;

    let summary = h.scheduler.tick().await;

    assert_eq!(summary.demoted, vec!["a".to_string()]);
    assert_eq!(h.worker.stopped(), vec!["a".to_string()]);
    assert_eq!(status(&h, "a"), TaskStatus::WaitingClose);
    assert!(h.scheduler.registry().get("a").unwrap().has_session());
    let stats = h.scheduler.stats();
    assert_eq!(stats.cumulative.mining_started, 3);
    assert_eq!(stats.cumulative.success, 1);
    assert_eq!(stats.logged_in, 0);
}

#[tokio::test]
async fn unconfirmed_stop_past_completion_closes_task() {
    let mut h = completed_newest_with_two_miners().await;
    h.worker.refuse_stop("a");

    h.scheduler.tick().await;

    assert_eq!(status(&h, "a"), TaskStatus::Closed);
    assert!(h.worker.closed().contains(&"a".to_string()));
    let stats = h.scheduler.stats();
    assert_eq!(stats.cumulative.total_completed, 1);
    assert_eq!(stats.tracked_tasks(), 2);
    assert_eq!(h.scheduler.registry().active_mining(), 2);
}

#[tokio::test]
async fn preemption_demotes_newest_even_when_it_was_mining() {
    let mut h = harness(config(2, 3, 3), &["a", "b", "c"]);
    h.scheduler.tick().await;

    // b looks idle but is actually working; a and c report mining
    h.worker.set_status("a", SessionStatus::Mining);
    h.worker.set_status("b", SessionStatus::Initializing);
    h.worker.set_active("b", true);
    h.worker.set_status("c", SessionStatus::Mining);

    let summary = h.scheduler.tick().await;

    assert_eq!(summary.demoted, vec!["c".to_string()]);
    assert_eq!(status(&h, "c"), TaskStatus::Initializing);
    assert!(!h.scheduler.stats().has_mining_start("c"));
    // b took the freed slot in the start phase; c's start was reverted
    assert_eq!(status(&h, "a"), TaskStatus::Mining);
    assert_eq!(status(&h, "b"), TaskStatus::Mining);
    assert_eq!(h.scheduler.stats().cumulative.mining_started, 2);
    assert_eq!(h.scheduler.stats().logged_in, 1);
}

#[tokio::test]
async fn failed_demotion_closes_task() {
    let mut h = harness(config(2, 3, 3), &["a", "b", "c"]);
    h.scheduler.tick().await;
    h.worker.set_all(&["a", "b", "c"], SessionStatus::Mining);
    h.worker.refuse_stop("c");

    h.scheduler.tick().await;

    assert_eq!(status(&h, "c"), TaskStatus::Closed);
    assert!(h.scheduler.registry().get("c").unwrap().session.is_none());
    assert!(h.worker.closed().contains(&"c".to_string()));
    assert_eq!(h.scheduler.stats().logged_in, 0);
    assert_eq!(h.scheduler.registry().active_mining(), 2);
}

#[tokio::test]
async fn ceilings_hold_across_ticks() {
    let ids = ["t1", "t2", "t3", "t4", "t5", "t6"];
    let cfg = config(2, 4, 2);
    let mut h = harness(cfg.clone(), &ids);

    for round in 0..12 {
        h.worker.set_all(&ids, SessionStatus::Mining);
        h.scheduler.tick().await;

        let usage = h.scheduler.usage();
        assert!(usage.active_mining <= cfg.max_active_mining, "round {round}");
        assert!(usage.initializing <= cfg.page_open_concurrency, "round {round}");
        assert!(usage.open_sessions <= cfg.max_open_pages.min(ids.len()), "round {round}");
        assert_eq!(usage.open_sessions, h.worker.live_sessions());
    }
}

#[tokio::test]
async fn intake_respects_page_open_concurrency() {
    let mut h = harness(config(5, 10, 2), &["a", "b", "c", "d", "e"]);

    assert_eq!(h.scheduler.tick().await.admitted, 2);
    // still loading: nothing more may open
    assert_eq!(h.scheduler.tick().await.admitted, 0);
    assert_eq!(h.scheduler.registry().count(TaskStatus::Pending), 3);

    h.worker.set_all(&["a", "b"], SessionStatus::Initializing);
    h.scheduler.tick().await;
    // intake ran before the start phase, so the freed slots count next tick
    assert_eq!(h.scheduler.registry().count(TaskStatus::Mining), 2);
    assert_eq!(h.worker.opened(), vec!["a", "b"]);

    assert_eq!(h.scheduler.tick().await.admitted, 2);
    assert_eq!(h.worker.opened(), vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn intake_respects_open_pages() {
    let mut h = harness(config(5, 2, 5), &["a", "b", "c"]);
    h.scheduler.tick().await;
    assert_eq!(h.scheduler.registry().open_sessions(), 2);
    assert_eq!(status(&h, "c"), TaskStatus::Pending);
}

#[tokio::test]
async fn spurious_completion_is_ignored() {
    let mut h = harness(config(2, 3, 3), &["a"]);
    h.scheduler.tick().await;

    h.worker.set_status("a", SessionStatus::Completed);
    h.scheduler.tick().await;

    assert_eq!(status(&h, "a"), TaskStatus::Initializing);
    assert_eq!(h.scheduler.stats().cumulative.success, 0);
}

#[tokio::test]
async fn completed_task_closes_only_after_wait() {
    let mut h = harness(config(2, 3, 3), &["a"]);
    mine_single(&mut h, "a").await;

    h.worker.set_status("a", SessionStatus::Completed);
    h.scheduler.tick().await;
    let completed_at = h.clock.now();
    assert_eq!(status(&h, "a"), TaskStatus::WaitingClose);
    assert_eq!(
        h.scheduler.registry().get("a").unwrap().completion_wait_start,
        Some(completed_at)
    );

    // polling is skipped while waiting, so a late error report is not seen
    h.worker.set_status("a", SessionStatus::Error);
    h.clock.advance(chrono::Duration::seconds(29));
    h.scheduler.tick().await;
    assert_eq!(status(&h, "a"), TaskStatus::WaitingClose);
    assert_eq!(h.scheduler.stats().cumulative.failed, 0);

    h.clock.advance(chrono::Duration::seconds(1));
    let summary = h.scheduler.tick().await;
    assert_eq!(summary.closed, 1);
    assert_eq!(status(&h, "a"), TaskStatus::Closed);
    assert_eq!(h.worker.closed(), vec!["a".to_string()]);

    let stats = h.scheduler.stats();
    assert_eq!(stats.cumulative.success, 1);
    assert_eq!(stats.cumulative.total_completed, 1);
    assert_eq!(stats.cycle_completed, 1);
    assert_eq!(stats.tracked_tasks(), 0);
}

#[tokio::test]
async fn worker_failures_stay_isolated() {
    let mut h = harness(config(3, 3, 3), &["a", "b", "c"]);
    h.worker.fail_open("b");

    let summary = h.scheduler.tick().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(status(&h, "b"), TaskStatus::Error);
    assert!(h.scheduler.registry().get("b").unwrap().error.is_some());
    assert_eq!(status(&h, "a"), TaskStatus::Initializing);
    assert_eq!(status(&h, "c"), TaskStatus::Initializing);

    h.worker.set_status("a", SessionStatus::Error);
    h.worker.set_status("c", SessionStatus::Initializing);
    h.scheduler.tick().await;

    assert_eq!(status(&h, "a"), TaskStatus::Error);
    assert!(h.scheduler.registry().get("a").unwrap().session.is_none());
    assert_eq!(status(&h, "c"), TaskStatus::Mining);
    assert_eq!(h.scheduler.stats().cumulative.failed, 2);
    // errored tasks stay out until the next cycle
    assert_eq!(h.scheduler.registry().count(TaskStatus::Pending), 0);
}

#[tokio::test]
async fn cycle_reset_restarts_everything_and_keeps_cumulative() {
    let mut h = harness(config(2, 3, 3), &["a"]);
    let mut expected_completed = 0;

    for cycle in 1..=3u64 {
        assert_eq!(h.scheduler.stats().cycle, cycle);
        mine_single(&mut h, "a").await;
        h.worker.set_status("a", SessionStatus::Completed);
        h.scheduler.tick().await;
        h.clock.advance(chrono::Duration::seconds(30));
        h.scheduler.tick().await;
        assert_eq!(status(&h, "a"), TaskStatus::Closed);
        expected_completed += 1;

        // next hour: the task's old script must not leak into the new session
        h.worker.set_status("a", SessionStatus::Pending);
        h.clock.advance(chrono::Duration::hours(1));
        let summary = h.scheduler.tick().await;
        assert!(summary.cycle_reset);

        let stats = h.scheduler.stats();
        assert_eq!(stats.cycle, cycle + 1);
        assert_eq!(stats.cycle_completed, 0);
        assert_eq!(stats.logged_in, 0);
        assert_eq!(stats.cumulative.total_completed, expected_completed);
        assert_eq!(stats.cumulative.success, expected_completed);
        assert_eq!(stats.cumulative.mining_started, expected_completed);
        // reset ran first, then intake re-admitted the task
        assert_eq!(status(&h, "a"), TaskStatus::Initializing);
        assert_eq!(stats.logging_in, 1);
    }
}

#[tokio::test]
async fn cycle_reset_abandons_completion_wait() {
    let mut h = harness(config(2, 3, 3), &["a"]);
    mine_single(&mut h, "a").await;

    h.clock.set(Utc.with_ymd_and_hms(2026, 3, 1, 10, 59, 45).unwrap());
    h.worker.set_status("a", SessionStatus::Completed);
    h.scheduler.tick().await;
    assert_eq!(status(&h, "a"), TaskStatus::WaitingClose);

    // halfway through the wait the hour turns
    h.worker.set_status("a", SessionStatus::Pending);
    h.clock.advance(chrono::Duration::seconds(15));
    let summary = h.scheduler.tick().await;

    assert!(summary.cycle_reset);
    assert_eq!(summary.closed, 0);
    let task = h.scheduler.registry().get("a").unwrap();
    assert_eq!(task.completion_wait_start, None);
    assert_eq!(task.status, TaskStatus::Initializing);
    assert_eq!(h.worker.closed(), vec!["a".to_string()]);

    let stats = h.scheduler.stats();
    assert_eq!(stats.cumulative.success, 1);
    assert_eq!(stats.cumulative.total_completed, 0);
    assert_eq!(stats.cycle_completed, 0);

    // the old wait never fires in the new cycle
    h.clock.advance(chrono::Duration::seconds(30));
    assert_eq!(h.scheduler.tick().await.closed, 0);
    assert_eq!(h.scheduler.stats().cumulative.total_completed, 0);
}

#[tokio::test]
async fn cycle_reset_survives_close_failures() {
    let mut h = harness(config(2, 3, 3), &["a", "b"]);
    h.scheduler.tick().await;
    h.worker.set_all(&["a", "b"], SessionStatus::Initializing);
    h.scheduler.tick().await;
    assert_eq!(h.scheduler.registry().active_mining(), 2);

    h.worker.set_close_fails(true);
    h.worker.set_all(&["a", "b"], SessionStatus::Pending);
    h.clock.advance(chrono::Duration::hours(1));
    h.scheduler.tick().await;

    assert_eq!(h.scheduler.stats().cycle, 2);
    assert_eq!(h.worker.closed().len(), 2);
    assert_eq!(h.scheduler.registry().active_mining(), 0);
    for id in ["a", "b"] {
        let task = h.scheduler.registry().get(id).unwrap();
        assert!(task.error.is_none());
        assert_eq!(task.status, TaskStatus::Initializing);
    }

    // same hour, no second reset
    h.clock.advance(chrono::Duration::minutes(10));
    assert!(!h.scheduler.tick().await.cycle_reset);
}

#[tokio::test]
async fn status_report_reflects_fleet() {
    let mut h = harness(config(1, 3, 3), &["a", "b"]);
    h.scheduler.tick().await;
    h.worker.set_all(&["a", "b"], SessionStatus::Initializing);
    h.scheduler.tick().await;

    let report = h.scheduler.status_report();
    assert!(report.running);
    assert_eq!(report.cycle, 1);
    assert_eq!(report.count(TaskStatus::Mining), 1);
    assert_eq!(report.count(TaskStatus::Initializing), 1);
    assert_eq!(report.mining.active, 1);
    assert_eq!(report.mining.max, 1);
    assert_eq!(report.open_pages.active, 2);
    assert_eq!(report.logged_in, 1);
    assert_eq!(report.average_login_secs, Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn driver_ticks_until_stopped_then_closes_sessions() {
    let h = harness(config(2, 3, 3), &["a", "b"]);
    let worker = Arc::clone(&h.worker);
    let handle = spawn_scheduler_loop(h.scheduler);

    let mut reports = handle.reports();
    reports.changed().await.unwrap();
    assert!(reports.borrow().running);

    worker.set_all(&["a", "b"], SessionStatus::Initializing);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(handle.latest().mining.active, 2);

    let scheduler = handle.stop().await.unwrap();
    assert!(!scheduler.is_running());
    assert_eq!(scheduler.registry().open_sessions(), 0);
    assert_eq!(worker.live_sessions(), 0);
    assert_eq!(scheduler.registry().count(TaskStatus::Closed), 2);
}
