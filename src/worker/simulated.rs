//! In-memory session worker used for dry runs.
//!
//! Sessions become ready after a random login delay and finish a random
//! while after work starts. Opening a session is a "navigation", so it goes
//! through the shared rate-limited queue like a real driver's would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::debug;

use super::{SessionHandle, SessionStatus, SessionWorker};
use crate::clock::Clock;
use crate::error::WorkerError;
use crate::exec::OperationQueue;
use crate::task::TaskRecord;

/// Timing and failure knobs for the simulation.
#[derive(Debug, Clone)]
pub struct SimulationProfile {
    pub login_min: Duration,
    pub login_max: Duration,
    pub mining_min: Duration,
    pub mining_max: Duration,
    /// Probability that one navigation attempt fails transiently.
    pub navigation_failure_rate: f64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            login_min: Duration::from_secs(10),
            login_max: Duration::from_secs(40),
            mining_min: Duration::from_secs(120),
            mining_max: Duration::from_secs(600),
            navigation_failure_rate: 0.05,
        }
    }
}

#[derive(Debug)]
struct SimSession {
    ready_at: DateTime<Utc>,
    /// Finish time once work has started.
    finish_at: Option<DateTime<Utc>>,
}

/// A [`SessionWorker`] that simulates sessions in memory.
pub struct SimulatedWorker {
    queue: OperationQueue,
    clock: Arc<dyn Clock>,
    profile: SimulationProfile,
    sessions: Mutex<HashMap<SessionHandle, SimSession>>,
}

impl SimulatedWorker {
    pub fn new(queue: OperationQueue, clock: Arc<dyn Clock>, profile: SimulationProfile) -> Self {
        Self {
            queue,
            clock,
            profile,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of sessions currently open.
    pub async fn open_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn random_between(min: Duration, max: Duration) -> chrono::Duration {
        let (lo, hi) = (min.as_millis() as i64, max.as_millis() as i64);
        let ms = if hi > lo {
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            lo
        };
        chrono::Duration::milliseconds(ms)
    }
}

#[async_trait]
impl SessionWorker for SimulatedWorker {
    async fn open(&self, task: &TaskRecord) -> Result<SessionHandle, WorkerError> {
        let failure_rate = self.profile.navigation_failure_rate.clamp(0.0, 1.0);
        let target = task.target.clone();

        self.queue
            .enqueue(move || {
                let fail = rand::thread_rng().gen_bool(failure_rate);
                let target = target.clone();
                async move {
                    if fail {
                        Err(WorkerError::Transient(format!("navigation to {target} reset")))
                    } else {
                        Ok(())
                    }
                }
            })
            .await?;

        let handle = SessionHandle::new();
        let login = Self::random_between(self.profile.login_min, self.profile.login_max);
        self.sessions.lock().await.insert(
            handle.clone(),
            SimSession {
                ready_at: self.clock.now() + login,
                finish_at: None,
            },
        );
        debug!(task_id = %task.id, session = %handle, "Simulated session opened");
        Ok(handle)
    }

    async fn poll_status(&self, session: &SessionHandle) -> Result<SessionStatus, WorkerError> {
        let now = self.clock.now();
        let sessions = self.sessions.lock().await;
        let sim = sessions
            .get(session)
            .ok_or_else(|| WorkerError::SessionNotFound(session.to_string()))?;

        Ok(match sim.finish_at {
            Some(finish) if now >= finish => SessionStatus::Completed,
            Some(_) => SessionStatus::Mining,
            None if now >= sim.ready_at => SessionStatus::Initializing,
            None => SessionStatus::Pending,
        })
    }

    async fn confirm_active(&self, session: &SessionHandle) -> Result<bool, WorkerError> {
        let now = self.clock.now();
        let sessions = self.sessions.lock().await;
        let sim = sessions
            .get(session)
            .ok_or_else(|| WorkerError::SessionNotFound(session.to_string()))?;
        Ok(matches!(sim.finish_at, Some(finish) if now < finish))
    }

    async fn start(&self, session: &SessionHandle) -> Result<bool, WorkerError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().await;
        let sim = sessions
            .get_mut(session)
            .ok_or_else(|| WorkerError::SessionNotFound(session.to_string()))?;

        if now < sim.ready_at {
            return Ok(false);
        }
        if sim.finish_at.is_none() {
            let run = Self::random_between(self.profile.mining_min, self.profile.mining_max);
            sim.finish_at = Some(now + run);
        }
        Ok(true)
    }

    async fn stop(&self, session: &SessionHandle) -> Result<bool, WorkerError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().await;
        let sim = sessions
            .get_mut(session)
            .ok_or_else(|| WorkerError::SessionNotFound(session.to_string()))?;

        match sim.finish_at {
            Some(finish) if now >= finish => Ok(false),
            _ => {
                sim.finish_at = None;
                Ok(true)
            }
        }
    }

    async fn close(&self, session: &SessionHandle) -> Result<(), WorkerError> {
        self.sessions.lock().await.remove(session);
        Ok(())
    }
}
