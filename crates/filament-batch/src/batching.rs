use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use crate::error::{QueueError, QueueResult};

/// Tuning for a [`BatchingQueue`].
#[derive(Clone, Debug)]
pub struct BatchingQueueOptions {
    /// A batch flushes as soon as it reaches this many items.
    pub max_batch_size: usize,
    /// A non-empty batch flushes at latest this long after its first item.
    pub max_wait: Duration,
}

impl Default for BatchingQueueOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_wait: Duration::from_millis(100),
        }
    }
}

struct Shared<T> {
    pending: Mutex<VecDeque<T>>,
    notify: Notify,
    disposed: AtomicBool,
}

/// Time/size-bounded batch coalescer.
///
/// Items enter through a non-blocking [`add`]; a background worker groups
/// them into batches of at most `max_batch_size`, flushing early when
/// `max_wait` elapses, and hands each batch to the consumer half returned
/// by [`new`]. Disposal flushes whatever is pending before the batch
/// channel closes — items are never silently dropped.
///
/// [`add`]: BatchingQueue::add
/// [`new`]: BatchingQueue::new
pub struct BatchingQueue<T> {
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BatchingQueue<T> {
    /// Create a queue and the receiver its batches are delivered on.
    ///
    /// The receiver yields `Vec<T>` batches and closes once the queue has
    /// been disposed and fully drained.
    pub fn new(options: BatchingQueueOptions) -> (Self, mpsc::Receiver<Vec<T>>) {
        let (tx, rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            disposed: AtomicBool::new(false),
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), tx, options));
        (
            Self {
                shared,
                worker: Mutex::new(Some(worker)),
            },
            rx,
        )
    }

    /// Enqueue an item for the next batch. Never blocks.
    pub fn add(&self, item: T) -> QueueResult<()> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(QueueError::Disposed);
        }
        self.shared.pending.lock().expect("lock poisoned").push_back(item);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Items waiting for the next flush.
    pub fn len(&self) -> usize {
        self.shared.pending.lock().expect("lock poisoned").len()
    }

    /// Returns `true` if no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Stop accepting items, flush the remainder, and wait for the worker
    /// to exit. The batch receiver closes once the flush is delivered.
    pub async fn dispose_async(&self) -> QueueResult<()> {
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        let worker = self.worker.lock().expect("lock poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        Ok(())
    }
}

impl<T> Drop for BatchingQueue<T> {
    fn drop(&mut self) {
        // Dropping without dispose still lets the worker drain and exit.
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

async fn run_worker<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    tx: mpsc::Sender<Vec<T>>,
    options: BatchingQueueOptions,
) {
    'outer: loop {
        // Wait for the first item of the next batch.
        loop {
            let notified = shared.notify.notified();
            if shared.disposed.load(Ordering::Acquire) {
                break 'outer;
            }
            if !shared.pending.lock().expect("lock poisoned").is_empty() {
                break;
            }
            notified.await;
        }

        // Batch window: flush on size, deadline, or disposal.
        let deadline = Instant::now() + options.max_wait;
        loop {
            let notified = shared.notify.notified();
            if shared.disposed.load(Ordering::Acquire) {
                break;
            }
            let len = shared.pending.lock().expect("lock poisoned").len();
            if len >= options.max_batch_size {
                break;
            }
            if timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let batch = take_batch(&shared, options.max_batch_size);
        if !batch.is_empty() {
            trace!(len = batch.len(), "flushing batch");
            if tx.send(batch).await.is_err() {
                // Consumer is gone; nothing left to deliver to.
                return;
            }
        }
    }

    // Final drain after disposal.
    loop {
        let batch = take_batch(&shared, options.max_batch_size);
        if batch.is_empty() {
            break;
        }
        if tx.send(batch).await.is_err() {
            break;
        }
    }
}

fn take_batch<T>(shared: &Shared<T>, max: usize) -> Vec<T> {
    let mut pending = shared.pending.lock().expect("lock poisoned");
    let take = pending.len().min(max);
    pending.drain(..take).collect()
}
