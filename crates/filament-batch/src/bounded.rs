use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{QueueError, QueueResult};

/// FIFO hand-off between two pipeline stages.
///
/// A thin wrapper over a bounded channel with an explicit finished marker:
/// producers `push` (suspending when the consumer lags — this is the
/// pipeline's backpressure), the consumer `pop`s until `None`, and whoever
/// owns the stage boundary calls `finish` when no more items will arrive.
pub struct BoundedQueue<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
}

impl<T: Send> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Append an item, waiting for space if the consumer is behind.
    ///
    /// Fails with [`QueueError::Disposed`] once `finish` has been called.
    pub async fn push(&self, item: T) -> QueueResult<()> {
        let tx = self
            .tx
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .cloned()
            .ok_or(QueueError::Disposed)?;
        tx.send(item).await.map_err(|_| QueueError::Closed)
    }

    /// Take the next item, waiting until one arrives.
    ///
    /// Returns `None` once the queue is finished and drained.
    pub async fn pop(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Mark the queue finished: no further pushes; `pop` drains what is
    /// buffered and then returns `None`.
    pub fn finish(&self) {
        self.tx.lock().expect("lock poisoned").take();
    }

    /// Throw away everything currently buffered. Returns the number of
    /// items discarded. Producers blocked on `push` get their slot back.
    pub async fn clear_buffered(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    /// Whether `finish` has been called.
    pub fn is_finished(&self) -> bool {
        self.tx.lock().expect("lock poisoned").is_none()
    }
}
