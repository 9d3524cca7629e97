use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use crate::error::{QueueError, QueueResult};

/// Consumer of flushed pool batches.
///
/// `process` is one full round-trip for the batch; the calling worker does
/// not take another batch until it returns. Errors are the processor's to
/// route — the pool has no opinion on them.
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync {
    async fn process(&self, batch: Vec<T>);
}

/// Tuning for a [`BatchPool`].
#[derive(Clone, Debug)]
pub struct BatchPoolOptions {
    /// One worker per entry; entry *i* is worker *i*'s target batch size.
    ///
    /// Staggered sizes fit the access pattern of a closure download: a
    /// large opening batch to amortize round-trips, tapering toward the
    /// tail so stale requests are not over-fetched.
    pub sizes: Vec<usize>,
    /// A non-empty batch dispatches at latest this long after its first
    /// item.
    pub max_wait: Duration,
}

impl Default for BatchPoolOptions {
    fn default() -> Self {
        Self {
            sizes: vec![100],
            max_wait: Duration::from_millis(200),
        }
    }
}

struct PoolShared<T> {
    pending: Mutex<VecDeque<T>>,
    notify: Notify,
    disposed: AtomicBool,
    cancelled: AtomicBool,
}

/// A set of workers draining one shared queue in variably-sized batches.
///
/// Each worker owns a target batch size and has at most one `process`
/// round-trip in flight at a time. A batch dispatches when it reaches its
/// worker's size or when `max_wait` elapses with items pending.
/// [`dispose_async`] drains every queued item through a final flush;
/// [`cancel`] discards them.
///
/// [`dispose_async`]: BatchPool::dispose_async
/// [`cancel`]: BatchPool::cancel
pub struct BatchPool<T> {
    shared: Arc<PoolShared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> BatchPool<T> {
    /// Spawn one worker per configured batch size.
    pub fn new(options: BatchPoolOptions, processor: Arc<dyn BatchProcessor<T>>) -> Self {
        let shared = Arc::new(PoolShared {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            disposed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        let workers = options
            .sizes
            .iter()
            .enumerate()
            .map(|(slot, &size)| {
                tokio::spawn(run_worker(
                    Arc::clone(&shared),
                    Arc::clone(&processor),
                    slot,
                    size.max(1),
                    options.max_wait,
                ))
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue an item for the next batch. Never blocks.
    pub fn add(&self, item: T) -> QueueResult<()> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(QueueError::Disposed);
        }
        self.shared
            .pending
            .lock()
            .expect("lock poisoned")
            .push_back(item);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Items queued but not yet dispatched.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().expect("lock poisoned").len()
    }

    /// Whether the pool has been disposed or cancelled.
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Discard queued items and stop dispatching. In-flight round-trips
    /// run to completion; their results are the caller's to ignore.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.pending.lock().expect("lock poisoned").clear();
        self.shared.notify.notify_waiters();
    }

    /// Stop accepting items, flush everything still queued, and wait for
    /// all workers to finish their final round-trips.
    pub async fn dispose_async(&self) -> QueueResult<()> {
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        let workers = std::mem::take(&mut *self.workers.lock().expect("lock poisoned"));
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }
}

impl<T> Drop for BatchPool<T> {
    fn drop(&mut self) {
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

async fn run_worker<T: Send + 'static>(
    shared: Arc<PoolShared<T>>,
    processor: Arc<dyn BatchProcessor<T>>,
    slot: usize,
    size: usize,
    max_wait: Duration,
) {
    loop {
        // Wait for work (or shutdown).
        loop {
            let notified = shared.notify.notified();
            if shared.cancelled.load(Ordering::Acquire) {
                return;
            }
            let has_items = !shared.pending.lock().expect("lock poisoned").is_empty();
            if has_items {
                break;
            }
            if shared.disposed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }

        // Batch window: dispatch on size, deadline, or shutdown.
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = shared.notify.notified();
            if shared.disposed.load(Ordering::Acquire) {
                break;
            }
            if shared.pending.lock().expect("lock poisoned").len() >= size {
                break;
            }
            if timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        if shared.cancelled.load(Ordering::Acquire) {
            return;
        }
        let batch: Vec<T> = {
            let mut pending = shared.pending.lock().expect("lock poisoned");
            let take = pending.len().min(size);
            pending.drain(..take).collect()
        };
        if batch.is_empty() {
            continue;
        }
        trace!(slot, len = batch.len(), "dispatching batch");
        processor.process(batch).await;
    }
}
