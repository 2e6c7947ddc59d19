//! Tasks: the state machine and the in-memory registry.

pub mod registry;
pub mod state;

pub use registry::{TaskRecord, TaskRegistry};
pub use state::TaskStatus;
