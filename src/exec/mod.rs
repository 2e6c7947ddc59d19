//! Outbound operation execution: retry with backoff and the global
//! rate-limited queue built on it.

pub mod backoff;
pub mod queue;

pub use backoff::Backoff;
pub use queue::{OperationQueue, Retryable};
