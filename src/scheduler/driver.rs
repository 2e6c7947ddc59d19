//! Self-rescheduling tick driver.
//!
//! Each tick is awaited to completion before the next sleep starts, so two
//! ticks never overlap however long a tick takes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::core::Scheduler;
use super::report::StatusReport;

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    join: JoinHandle<Scheduler>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    reports: watch::Receiver<StatusReport>,
}

impl SchedulerHandle {
    /// Subscribe to the report published after every tick.
    pub fn reports(&self) -> watch::Receiver<StatusReport> {
        self.reports.clone()
    }

    /// Most recently published report.
    pub fn latest(&self) -> StatusReport {
        self.reports.borrow().clone()
    }

    /// Request a stop, wait for the in-flight tick and the shutdown sweep,
    /// and hand the scheduler back.
    pub async fn stop(self) -> Result<Scheduler, tokio::task::JoinError> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.join.await
    }
}

/// Spawn the scheduler loop.
pub fn spawn_scheduler_loop(mut scheduler: Scheduler) -> SchedulerHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let (report_tx, reports) = watch::channel(scheduler.status_report());

    let stop_flag = Arc::clone(&shutdown);
    let woken = Arc::clone(&wake);
    let interval = scheduler.config().status_check_interval;

    let join = tokio::spawn(async move {
        info!(
            tasks = scheduler.registry().len(),
            interval_ms = interval.as_millis() as u64,
            "Scheduler loop started"
        );

        while !stop_flag.load(Ordering::SeqCst) {
            let summary = scheduler.tick().await;
            if summary.failed > 0 {
                warn!(failed = summary.failed, "Tasks failed during tick");
            }

            let report = scheduler.status_report();
            info!(
                cycle = report.cycle,
                mining = report.mining.active,
                max_mining = report.mining.max,
                open_pages = report.open_pages.active,
                max_pages = report.open_pages.max,
                completed = report.cumulative.total_completed,
                "Scheduler status"
            );
            // Receivers may all be gone
            let _ = report_tx.send(report);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = woken.notified() => {}
            }
        }

        scheduler.shutdown().await;
        let _ = report_tx.send(scheduler.status_report());
        info!("Scheduler loop stopped");
        scheduler
    });

    SchedulerHandle {
        join,
        shutdown,
        wake,
        reports,
    }
}
