use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use filament_batch::{BatchingQueue, BatchingQueueOptions};
use filament_store::ObjectDatabase;
use filament_types::{BaseId, Item};

use crate::error::{CacheError, CacheResult};
use crate::reference_aware::{CacheOptions, ReferenceAwareCache};

/// Tuning for a [`PersistentCache`].
#[derive(Clone, Debug)]
pub struct PersistentCacheOptions {
    /// Coalesced read batch size.
    pub max_read_size: usize,
    /// A partially-filled read batch flushes after this long.
    pub max_read_wait: Duration,
    /// Session-local hot index tuning.
    pub index: CacheOptions,
}

impl Default for PersistentCacheOptions {
    fn default() -> Self {
        Self {
            max_read_size: 100,
            max_read_wait: Duration::from_millis(20),
            index: CacheOptions::default(),
        }
    }
}

/// Where batched read results go: hits carry the stored item, misses fall
/// through to the next tier (the network).
#[async_trait]
pub trait ReadRouter: Send + Sync {
    async fn on_hit(&self, item: Item);
    async fn on_miss(&self, id: BaseId);
}

/// Batched read-through facade over the persistent store.
///
/// Lookups requested with [`request`] coalesce into `get_all` batches;
/// each result is routed through the [`ReadRouter`]. A session-local
/// [`ReferenceAwareCache`] index keeps hot persistent reads under the same
/// sliding-TTL/reference discipline as the memory tier. The store's
/// one-time [`warm_up`] hook is surfaced here so platform workarounds stay
/// out of cache logic.
///
/// The store itself is shared and outlives this facade; disposing the
/// facade tears down the read machinery only.
///
/// [`request`]: PersistentCache::request
/// [`warm_up`]: PersistentCache::warm_up
pub struct PersistentCache {
    store: Arc<dyn ObjectDatabase>,
    index: Arc<ReferenceAwareCache>,
    read_queue: BatchingQueue<BaseId>,
    reader: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl PersistentCache {
    pub fn new(
        store: Arc<dyn ObjectDatabase>,
        options: PersistentCacheOptions,
        router: Arc<dyn ReadRouter>,
    ) -> Self {
        let (read_queue, batches) = BatchingQueue::new(BatchingQueueOptions {
            max_batch_size: options.max_read_size,
            max_wait: options.max_read_wait,
        });
        let index = Arc::new(ReferenceAwareCache::new(options.index));
        let reader = tokio::spawn(run_reader(
            batches,
            Arc::clone(&store),
            Arc::clone(&index),
            router,
        ));
        Self {
            store,
            index,
            read_queue,
            reader: Mutex::new(Some(reader)),
            disposed: AtomicBool::new(false),
        }
    }

    fn check_live(&self) -> CacheResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::Disposed);
        }
        Ok(())
    }

    /// Queue a lookup; the result reaches the router once its batch
    /// flushes.
    pub fn request(&self, id: BaseId) -> CacheResult<()> {
        self.check_live()?;
        self.read_queue.add(id).map_err(|_| CacheError::Disposed)
    }

    /// Direct single lookup, bypassing batching: hot index first, then the
    /// store. Hits are entered into the index.
    pub async fn get_one(&self, id: &BaseId) -> CacheResult<Option<Item>> {
        self.check_live()?;
        if let Some(item) = self.index.get(id)? {
            return Ok(Some(item));
        }
        let mut results = self.store.get_all(std::slice::from_ref(id)).await?;
        match results.pop().flatten() {
            Some(item) => {
                self.index.add(&item, &mut |_| {})?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Batched read straight from the store.
    pub async fn get_all(&self, ids: &[BaseId]) -> CacheResult<Vec<Option<Item>>> {
        self.check_live()?;
        Ok(self.store.get_all(ids).await?)
    }

    /// Batched write straight to the store.
    pub async fn put_all(&self, items: &[Item]) -> CacheResult<()> {
        self.check_live()?;
        Ok(self.store.put_all(items).await?)
    }

    /// Run the store's one-time initialization.
    pub async fn warm_up(&self) -> CacheResult<()> {
        self.check_live()?;
        Ok(self.store.warm_up().await?)
    }

    /// The session-local hot index.
    pub fn index(&self) -> &ReferenceAwareCache {
        &self.index
    }

    /// Tear down the read machinery. The shared store is left open for its
    /// owner to dispose.
    pub async fn dispose_async(&self) -> CacheResult<()> {
        self.disposed.store(true, Ordering::Release);
        self.read_queue.dispose_async().await.ok();
        let reader = self.reader.lock().expect("lock poisoned").take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        self.index.dispose();
        Ok(())
    }
}

async fn run_reader(
    mut batches: mpsc::Receiver<Vec<BaseId>>,
    store: Arc<dyn ObjectDatabase>,
    index: Arc<ReferenceAwareCache>,
    router: Arc<dyn ReadRouter>,
) {
    while let Some(batch) = batches.recv().await {
        // The queue may carry an id twice if it was requested from two
        // places before the flush; read each once.
        let mut unique: Vec<BaseId> = Vec::with_capacity(batch.len());
        for id in batch {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        debug!(count = unique.len(), "persistent read batch");

        match store.get_all(&unique).await {
            Ok(results) => {
                for (id, result) in unique.into_iter().zip(results) {
                    match result {
                        Some(item) => {
                            let _ = index.add(&item, &mut |_| {});
                            router.on_hit(item).await;
                        }
                        None => router.on_miss(id).await,
                    }
                }
            }
            Err(error) => {
                // A failed read batch is not fatal to the load: fall
                // through to the network for every id in it.
                warn!(%error, "persistent read batch failed");
                for id in unique {
                    router.on_miss(id).await;
                }
            }
        }
    }
}
