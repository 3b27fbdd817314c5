//! Keyed Sequential Queue
//!
//! Runs asynchronous jobs one at a time per key while unrelated keys proceed
//! concurrently. Each key keeps only the "settled" signal of its most recent
//! job; a new job waits on that signal before starting, so job *n+1* never
//! overlaps job *n* and never inherits its failure.

pub mod occupancy;

use crate::error::CoreError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub use occupancy::{OccupancyEntry, QueueOccupancy};

/// Resolves once the job it belongs to has settled (success, failure or panic).
type Settled = Shared<BoxFuture<'static, ()>>;

struct TailEntry {
    seq: u64,
    settled: Settled,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Keys with at least one job queued or running
    pub active_keys: usize,
    /// Jobs waiting for their predecessor
    pub pending: usize,
    /// Jobs currently executing
    pub running: usize,
    /// Jobs that resolved with `Ok`
    pub completed: usize,
    /// Jobs that resolved with `Err` or panicked
    pub failed: usize,
}

struct QueueInner<K> {
    tails: Mutex<HashMap<K, TailEntry>>,
    stats: Mutex<QueueStats>,
    next_seq: AtomicU64,
}

/// Per-key FIFO scheduler.
///
/// `enqueue` must be called from within a tokio runtime; every job runs on
/// its own spawned task.
pub struct KeyedSequentialQueue<K> {
    inner: Arc<QueueInner<K>>,
}

impl<K> Clone for KeyedSequentialQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for KeyedSequentialQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedSequentialQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                tails: Mutex::new(HashMap::new()),
                stats: Mutex::new(QueueStats::default()),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Append `job` to the chain for `key`.
    ///
    /// The job's position is fixed when this call returns, not when the
    /// handle is first polled. Dropping the handle does not cancel the job.
    pub fn enqueue<F, Fut, T>(&self, key: K, job: F) -> JobHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
        T: Send + 'static,
    {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (settled_tx, settled_rx) = oneshot::channel::<()>();
        // A dropped sender also resolves the receiver, so a job that never
        // reaches the end of its task still releases its successor.
        let settled: Settled = settled_rx.map(|_| ()).boxed().shared();

        let previous = {
            let mut tails = self.inner.tails.lock();
            tails
                .insert(key.clone(), TailEntry { seq, settled })
                .map(|entry| entry.settled)
        };
        self.inner.stats.lock().pending += 1;

        debug!(key = ?key, seq, chained = previous.is_some(), "Enqueued job");

        let (result_tx, result_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let guard = SettleGuard {
                inner: Arc::clone(&inner),
                key,
                seq,
                _settled: settled_tx,
            };

            if let Some(previous) = previous {
                previous.await;
            }

            {
                let mut stats = inner.stats.lock();
                stats.pending = stats.pending.saturating_sub(1);
                stats.running += 1;
            }
            let started = Instant::now();

            let outcome = match AssertUnwindSafe(async move { job().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(CoreError::JobPanicked(panic_message(payload.as_ref()))),
            };

            {
                let mut stats = inner.stats.lock();
                stats.running = stats.running.saturating_sub(1);
                match &outcome {
                    Ok(_) => stats.completed += 1,
                    Err(_) => stats.failed += 1,
                }
            }

            match &outcome {
                Ok(_) => debug!(
                    key = ?guard.key,
                    seq,
                    duration_ms = started.elapsed().as_millis(),
                    "Job completed"
                ),
                Err(err) => warn!(
                    key = ?guard.key,
                    seq,
                    error = %err,
                    duration_ms = started.elapsed().as_millis(),
                    "Job failed; chain continues"
                ),
            }

            // Release the successor and collect the key before the caller sees
            // the result.
            drop(guard);
            let _ = result_tx.send(outcome);
        });

        JobHandle { rx: result_rx }
    }

    /// Whether `key` has a job queued or running.
    pub fn is_busy(&self, key: &K) -> bool {
        self.inner.tails.lock().contains_key(key)
    }

    /// Number of keys with a live chain.
    pub fn active_keys(&self) -> usize {
        self.inner.tails.lock().len()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.active_keys = self.active_keys();
        stats
    }
}

/// Removes the key entry if it still points at this job, then signals
/// settlement by dropping the sender.
struct SettleGuard<K>
where
    K: Eq + Hash,
{
    inner: Arc<QueueInner<K>>,
    key: K,
    seq: u64,
    _settled: oneshot::Sender<()>,
}

impl<K> Drop for SettleGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut tails = self.inner.tails.lock();
        if tails.get(&self.key).map(|entry| entry.seq) == Some(self.seq) {
            tails.remove(&self.key);
        }
    }
}

/// Handle to a queued job; resolves with the job's own result.
#[must_use = "dropping a JobHandle discards the job's result (the job still runs)"]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T, CoreError>>,
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, CoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CoreError::JobDropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
