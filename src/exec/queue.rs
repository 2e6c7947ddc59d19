//! Rate-limited operation queue.
//!
//! Every enqueued operation runs on a single consumer task, strictly one at a
//! time and in enqueue order, no matter how many callers are waiting. The
//! consumer keeps at least `min_interval` between the starts of consecutive
//! operations. Each operation runs inside the [`Backoff`] executor, so its
//! transient retries finish before the next entry is started.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use super::backoff::Backoff;
use crate::config::QueueConfig;
use crate::error::{QueueError, WorkerError};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Errors that know whether they are worth retrying.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for WorkerError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// FIFO queue with one consumer and a minimum start-to-start spacing.
#[derive(Clone)]
pub struct OperationQueue {
    tx: mpsc::UnboundedSender<Job>,
    backoff: Backoff,
    depth: Arc<AtomicUsize>,
}

impl OperationQueue {
    /// Create the queue and spawn its consumer. Must be called inside a
    /// tokio runtime. The consumer exits once every clone is dropped.
    pub fn new(config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_consumer(rx, config.min_interval, Arc::clone(&depth)));
        info!(
            min_interval_ms = config.min_interval.as_millis() as u64,
            max_retries = config.retry.max_retries,
            "Operation queue started"
        );
        Self {
            tx,
            backoff: Backoff::new(config.retry),
            depth,
        }
    }

    /// Operations enqueued but not yet finished (including the running one).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Enqueue an operation, retrying it while its error is retryable.
    pub async fn enqueue<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Retryable + From<QueueError> + std::fmt::Display + Send + 'static,
    {
        self.enqueue_with(operation, |e: &E, _| e.is_retryable()).await
    }

    /// Enqueue an operation with a caller-supplied retry predicate.
    pub async fn enqueue_with<T, E, F, Fut, P>(&self, operation: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        P: Fn(&E, u32) -> bool + Send + 'static,
        T: Send + 'static,
        E: From<QueueError> + std::fmt::Display + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let backoff = self.backoff.clone();

        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = backoff.execute(operation, should_retry).await;
                // Caller may have given up waiting
                let _ = result_tx.send(result);
            })
        });

        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(E::from(QueueError::Closed));
        }

        result_rx.await.map_err(|_| E::from(QueueError::Dropped))?
    }
}

async fn run_consumer(mut rx: mpsc::UnboundedReceiver<Job>, min_interval: Duration, depth: Arc<AtomicUsize>) {
    let mut last_start: Option<Instant> = None;

    while let Some(job) = rx.recv().await {
        if let Some(prev) = last_start {
            let ready_at = prev + min_interval;
            if ready_at > Instant::now() {
                debug!(
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "Queue spacing operations"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        last_start = Some(Instant::now());
        job().await;
        depth.fetch_sub(1, Ordering::SeqCst);
    }

    debug!("Operation queue consumer stopped");
}
