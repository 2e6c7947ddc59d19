//! Fleet scheduler: drives long-lived remote sessions through their
//! workflow under hard concurrency ceilings, restarting all of them every
//! hour.

pub mod clock;
pub mod config;
pub mod error;
pub mod exec;
pub mod scheduler;
pub mod task;
pub mod worker;
