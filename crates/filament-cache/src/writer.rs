use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use filament_batch::{BatchingQueue, BatchingQueueOptions};
use filament_store::{ObjectDatabase, StoreError};
use filament_types::Item;

use crate::error::{CacheError, CacheResult};

/// Tuning for a [`CacheWriter`].
#[derive(Clone, Debug)]
pub struct CacheWriterOptions {
    /// Coalesced write batch size.
    pub max_write_size: usize,
    /// A partially-filled write batch flushes after this long.
    pub max_write_wait: Duration,
}

impl Default for CacheWriterOptions {
    fn default() -> Self {
        Self {
            max_write_size: 100,
            max_write_wait: Duration::from_millis(500),
        }
    }
}

/// Asynchronous, batched persistence of freshly-resolved items.
///
/// [`add`] never blocks the hot path; batches reach the store via its
/// `put_all`. On a store failure the writer goes into a failed state:
/// no further items are accepted or flushed, and the error surfaces from
/// [`dispose_async`]. Batched writes are best-effort acceleration — the
/// server remains the source of truth — so failing fast beats silently
/// dropping data or retrying forever.
///
/// [`add`]: CacheWriter::add
/// [`dispose_async`]: CacheWriter::dispose_async
pub struct CacheWriter {
    store: Arc<dyn ObjectDatabase>,
    queue: BatchingQueue<Item>,
    worker: Mutex<Option<JoinHandle<()>>>,
    failure: Arc<Mutex<Option<StoreError>>>,
    disposed: AtomicBool,
}

impl CacheWriter {
    pub fn new(store: Arc<dyn ObjectDatabase>, options: CacheWriterOptions) -> Self {
        let (queue, batches) = BatchingQueue::new(BatchingQueueOptions {
            max_batch_size: options.max_write_size,
            max_wait: options.max_write_wait,
        });
        let failure = Arc::new(Mutex::new(None));
        let worker = tokio::spawn(run_writer(
            batches,
            Arc::clone(&store),
            Arc::clone(&failure),
        ));
        Self {
            store,
            queue,
            worker: Mutex::new(Some(worker)),
            failure,
            disposed: AtomicBool::new(false),
        }
    }

    /// Queue an item for the next write batch. Never blocks.
    pub fn add(&self, item: Item) -> CacheResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::Disposed);
        }
        if let Some(error) = self.failure.lock().expect("lock poisoned").as_ref() {
            return Err(CacheError::WriterFailed(error.to_string()));
        }
        self.queue.add(item).map_err(|_| CacheError::Disposed)
    }

    /// Write a batch synchronously, bypassing the coalescer (bulk import,
    /// final drain).
    pub async fn write_all(&self, items: &[Item]) -> CacheResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::Disposed);
        }
        Ok(self.store.put_all(items).await?)
    }

    /// Whether a store failure has halted the writer.
    pub fn has_failed(&self) -> bool {
        self.failure.lock().expect("lock poisoned").is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Drain in-flight writes and stop. Surfaces the first store failure,
    /// if any occurred.
    pub async fn dispose_async(&self) -> CacheResult<()> {
        self.disposed.store(true, Ordering::Release);
        self.queue.dispose_async().await.ok();
        let worker = self.worker.lock().expect("lock poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        match self.failure.lock().expect("lock poisoned").take() {
            Some(error) => Err(CacheError::Store(error)),
            None => Ok(()),
        }
    }
}

async fn run_writer(
    mut batches: mpsc::Receiver<Vec<Item>>,
    store: Arc<dyn ObjectDatabase>,
    failure: Arc<Mutex<Option<StoreError>>>,
) {
    while let Some(batch) = batches.recv().await {
        if failure.lock().expect("lock poisoned").is_some() {
            // Failed state: stop flushing rather than losing data silently
            // or retrying forever.
            continue;
        }
        debug!(count = batch.len(), "persisting item batch");
        if let Err(error) = store.put_all(&batch).await {
            warn!(%error, "cache write failed; writer halted");
            *failure.lock().expect("lock poisoned") = Some(error);
        }
    }
}
