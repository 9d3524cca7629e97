use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::warn;

use filament_cache::MemoryCache;
use filament_types::{scan_references, BaseId, Item};

use crate::error::{LoaderError, LoaderResult};

/// A pending interest in one id: resolved immediately from cache, or
/// fulfilled later when the item arrives.
pub enum Deferred {
    Ready(Item),
    Waiting(oneshot::Receiver<Item>),
}

impl Deferred {
    /// Wait for the item. Fails with [`LoaderError::Cancelled`] if the
    /// load that would have produced it was torn down first.
    pub async fn resolve(self) -> LoaderResult<Item> {
        match self {
            Self::Ready(item) => Ok(item),
            Self::Waiting(rx) => rx.await.map_err(|_| LoaderError::Cancelled),
        }
    }
}

/// How an id is covered after [`DefermentManager::ensure`].
pub enum Coverage {
    /// Already in the memory cache (TTL refreshed).
    Cached(Item),
    /// A fetch is already outstanding; do nothing.
    InFlight,
    /// Newly registered — the caller must trigger exactly one fetch.
    Registered,
}

/// Registry of ids that are known (referenced) but not yet resolved.
///
/// This is the load-bearing guard for the at-most-one-fetch invariant: an
/// id present in the memory cache or in the outstanding map is never
/// requested again, no matter how many documents reference it.
pub struct DefermentManager {
    cache: Arc<MemoryCache>,
    outstanding: Mutex<HashMap<BaseId, Vec<oneshot::Sender<Item>>>>,
    disposed: AtomicBool,
}

impl DefermentManager {
    pub fn new(cache: Arc<MemoryCache>) -> Self {
        Self {
            cache,
            outstanding: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    fn check_live(&self) -> LoaderResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(LoaderError::Disposed);
        }
        Ok(())
    }

    /// Register interest in an id.
    ///
    /// Returns the deferred item and whether the id was already known —
    /// either cached (resolves immediately) or outstanding (the returned
    /// waiter shares the in-flight fetch). When `false`, the caller owns
    /// triggering the fetch.
    pub fn defer(&self, id: &BaseId) -> LoaderResult<(Deferred, bool)> {
        self.check_live()?;
        if let Some(item) = self.cache.get(id)? {
            return Ok((Deferred::Ready(item), true));
        }
        let (tx, rx) = oneshot::channel();
        let mut outstanding = self.outstanding.lock().expect("lock poisoned");
        match outstanding.get_mut(id) {
            Some(waiters) => {
                waiters.push(tx);
                Ok((Deferred::Waiting(rx), true))
            }
            None => {
                outstanding.insert(id.clone(), vec![tx]);
                Ok((Deferred::Waiting(rx), false))
            }
        }
    }

    /// Register interest only if the id is already known: cached
    /// (resolves immediately) or in flight (shares the waiter). Returns
    /// `None` for unknown ids — the caller decides how to resolve those.
    pub fn defer_known(&self, id: &BaseId) -> LoaderResult<Option<Deferred>> {
        self.check_live()?;
        if let Some(item) = self.cache.get(id)? {
            return Ok(Some(Deferred::Ready(item)));
        }
        let mut outstanding = self.outstanding.lock().expect("lock poisoned");
        Ok(outstanding.get_mut(id).map(|waiters| {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            Deferred::Waiting(rx)
        }))
    }

    /// Cover an id without creating a waiter: cached, in flight, or newly
    /// registered (caller triggers the fetch).
    pub fn ensure(&self, id: &BaseId) -> LoaderResult<Coverage> {
        self.check_live()?;
        if let Some(item) = self.cache.get(id)? {
            return Ok(Coverage::Cached(item));
        }
        let mut outstanding = self.outstanding.lock().expect("lock poisoned");
        if outstanding.contains_key(id) {
            return Ok(Coverage::InFlight);
        }
        outstanding.insert(id.clone(), Vec::new());
        Ok(Coverage::Registered)
    }

    /// A resolved item has arrived: fulfill its waiters, enter it into the
    /// memory cache, and walk its references — each referenced id that is
    /// neither cached nor in flight is registered and reported through
    /// `on_missing` for fetching. Referenced ids that are already cached
    /// are returned so the caller can fold them into the result set.
    pub fn undefer(
        &self,
        item: &Item,
        on_missing: &mut dyn FnMut(&BaseId),
    ) -> LoaderResult<Vec<Item>> {
        self.check_live()?;
        let Some(base) = &item.base else {
            warn!(id = %item.base_id.short(), "undefer called with no document");
            return Ok(Vec::new());
        };

        self.fulfill(item);
        self.cache.add(item, &mut |_| {})?;

        let mut seen = HashSet::new();
        let mut refs = Vec::new();
        scan_references(base, |id| {
            if seen.insert(id.clone()) {
                refs.push(id.clone());
            }
        });

        let mut cached = Vec::new();
        for id in refs {
            match self.ensure(&id)? {
                Coverage::Cached(found) => cached.push(found),
                Coverage::InFlight => {}
                Coverage::Registered => on_missing(&id),
            }
        }
        Ok(cached)
    }

    /// Fulfill any waiters for this item's id. Returns how many waiters
    /// were woken.
    pub fn fulfill(&self, item: &Item) -> usize {
        let waiters = self
            .outstanding
            .lock()
            .expect("lock poisoned")
            .remove(&item.base_id);
        match waiters {
            Some(waiters) => {
                let count = waiters.len();
                for waiter in waiters {
                    let _ = waiter.send(item.clone());
                }
                count
            }
            None => 0,
        }
    }

    /// Give up on an id: drop its registration and waiters (they resolve
    /// as cancelled). Used when an item's document turns out unloadable.
    pub fn fail(&self, id: &BaseId) {
        self.outstanding.lock().expect("lock poisoned").remove(id);
    }

    /// Drop every registration without disposing the manager; pending
    /// waiters resolve as cancelled. Called when a load reaches a terminal
    /// state so stale registrations cannot bleed into the next load.
    pub fn clear(&self) {
        self.outstanding.lock().expect("lock poisoned").clear();
    }

    /// Whether a fetch is registered for this id.
    pub fn is_outstanding(&self, id: &BaseId) -> bool {
        self.outstanding.lock().expect("lock poisoned").contains_key(id)
    }

    /// Ids registered but not yet resolved.
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.lock().expect("lock poisoned").len()
    }

    /// Drop all registrations; pending waiters resolve as cancelled.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.outstanding.lock().expect("lock poisoned").clear();
    }
}
