//! Retry-with-backoff executor.
//!
//! Runs an async operation until it succeeds, the retry predicate declines,
//! or the policy's retry budget is spent. The delay before retry `n`
//! (zero-based attempt index of the failure) is
//! `min(initial_delay * multiplier^n, max_delay)`.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryPolicy;

/// Executes operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay to sleep after a failure at `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.policy.initial_delay.as_secs_f64();
        let factor = self.policy.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let max = self.policy.max_delay;
        let scaled = (base * factor).max(0.0);
        if !scaled.is_finite() || scaled >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Run `operation`, retrying while `should_retry(&error, attempt)` allows.
    ///
    /// The operation is invoked afresh for each attempt and must be safe to
    /// repeat.
    pub async fn execute<T, E, F, Fut, P>(&self, mut operation: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E, u32) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let last = attempt >= self.policy.max_retries;
                    if last || !should_retry(&e, attempt) {
                        debug!(attempt, error = %e, "Operation failed, not retrying");
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
