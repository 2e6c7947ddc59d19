//! Scheduler: admission control, preemption, hourly cycle resets and
//! statistics for the task fleet.

pub mod admission;
mod core;
pub mod cycle;
pub mod driver;
pub mod report;
pub mod stats;

pub use self::core::{Scheduler, TickSummary};
pub use driver::{SchedulerHandle, spawn_scheduler_loop};
pub use report::{StatusReport, Utilization};
pub use stats::{CumulativeStats, CycleStats};
