use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use filament_types::{BaseId, Item};

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectDatabase;

/// In-memory, HashMap-based object database.
///
/// Intended for tests and embedding. Items are held behind a `RwLock` and
/// cloned on read/write; reads never block each other.
pub struct InMemoryDatabase {
    items: RwLock<HashMap<BaseId, Item>>,
    disposed: AtomicBool,
    warm_ups: AtomicUsize,
}

impl InMemoryDatabase {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            warm_ups: AtomicUsize::new(0),
        }
    }

    /// Number of items currently stored.
    pub fn len(&self) -> usize {
        self.items.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().expect("lock poisoned").is_empty()
    }

    /// How many times `warm_up` has been invoked.
    pub fn warm_up_count(&self) -> usize {
        self.warm_ups.load(Ordering::Relaxed)
    }

    fn check_live(&self) -> StoreResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StoreError::Disposed);
        }
        Ok(())
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectDatabase for InMemoryDatabase {
    async fn get_all(&self, ids: &[BaseId]) -> StoreResult<Vec<Option<Item>>> {
        self.check_live()?;
        let map = self.items.read().expect("lock poisoned");
        Ok(ids.iter().map(|id| map.get(id).cloned()).collect())
    }

    async fn put_all(&self, items: &[Item]) -> StoreResult<()> {
        self.check_live()?;
        let mut map = self.items.write().expect("lock poisoned");
        for item in items {
            // Idempotent: content-addressing guarantees the same id always
            // maps to the same content.
            map.entry(item.base_id.clone())
                .or_insert_with(|| item.clone());
        }
        Ok(())
    }

    async fn warm_up(&self) -> StoreResult<()> {
        self.check_live()?;
        self.warm_ups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn dispose(&self) -> StoreResult<()> {
        self.disposed.store(true, Ordering::Release);
        self.items.write().expect("lock poisoned").clear();
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDatabase")
            .field("item_count", &self.len())
            .finish()
    }
}
