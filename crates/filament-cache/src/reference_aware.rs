use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use filament_types::{scan_references, Base, BaseId, Item};

use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};

/// Tuning for a [`ReferenceAwareCache`].
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Cumulative payload budget; exceeding it at insert time triggers an
    /// eviction pass.
    pub max_size_mb: u64,
    /// Sliding TTL, refreshed on every read.
    pub ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_size_mb: 2000,
            ttl: Duration::from_secs(15),
        }
    }
}

/// Eviction candidate snapshot used by the ordering helpers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub id: BaseId,
    pub size: u64,
    /// Whether some other currently-cached item references this entry.
    pub referenced: bool,
}

/// Unreferenced entries sort before referenced ones: a dependency must not
/// be evicted while its referrer is still live, even past its own TTL.
pub fn compare_by_references(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    a.referenced.cmp(&b.referenced)
}

/// Larger entries sort first; evicting them reclaims the budget in fewer
/// passes.
pub fn compare_by_size(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    b.size.cmp(&a.size)
}

/// The deterministic total order for eviction: reference protection
/// dominates, then size, then id.
pub fn eviction_order(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    compare_by_references(a, b)
        .then_with(|| compare_by_size(a, b))
        .then_with(|| a.id.cmp(&b.id))
}

struct Inner {
    entries: HashMap<BaseId, CacheEntry>,
    /// id → number of cached items whose documents reference it.
    referenced: HashMap<BaseId, usize>,
    total_bytes: u64,
}

/// TTL/size-bounded item cache that protects referenced dependencies.
///
/// Entries carry a sliding TTL. When an insert pushes the cumulative byte
/// size past the budget, expired entries are evicted — except those still
/// referenced by another cached item, which are retained regardless of
/// expiry (their absence would force a cascading re-fetch).
pub struct ReferenceAwareCache {
    inner: Mutex<Inner>,
    options: CacheOptions,
    disposed: AtomicBool,
}

impl ReferenceAwareCache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                referenced: HashMap::new(),
                total_bytes: 0,
            }),
            options,
            disposed: AtomicBool::new(false),
        }
    }

    fn check_live(&self) -> CacheResult<()> {
        if self.disposed.load(AtomicOrdering::Acquire) {
            return Err(CacheError::Disposed);
        }
        Ok(())
    }

    /// Insert an item, invoking `on_missing` for every reference in its
    /// document whose target is not already cached.
    ///
    /// Inserting an id twice refreshes its TTL without double-counting the
    /// accounting. Exceeding the size budget triggers [`cleanup`].
    ///
    /// [`cleanup`]: ReferenceAwareCache::cleanup
    pub fn add(&self, item: &Item, on_missing: &mut dyn FnMut(&BaseId)) -> CacheResult<()> {
        self.add_at(item, on_missing, Instant::now())
    }

    /// [`add`](ReferenceAwareCache::add) with an explicit clock, for tests.
    pub fn add_at(
        &self,
        item: &Item,
        on_missing: &mut dyn FnMut(&BaseId),
        now: Instant,
    ) -> CacheResult<()> {
        self.check_live()?;
        let over_budget = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if let Some(entry) = inner.entries.get_mut(&item.base_id) {
                entry.touch(now, self.options.ttl);
            } else {
                inner.total_bytes += item.byte_size();
                inner.entries.insert(
                    item.base_id.clone(),
                    CacheEntry::new(item.clone(), now, self.options.ttl),
                );
                for id in references_of(item) {
                    *inner.referenced.entry(id).or_insert(0) += 1;
                }
            }

            if let Some(base) = &item.base {
                let mut seen = HashSet::new();
                scan_references(base, |id| {
                    if seen.insert(id.clone()) && !inner.entries.contains_key(id) {
                        on_missing(id);
                    }
                });
            }
            inner.total_bytes > self.max_bytes()
        };

        if over_budget {
            self.cleanup(now)?;
        }
        Ok(())
    }

    /// Look up an item, refreshing its sliding TTL on a hit.
    pub fn get(&self, id: &BaseId) -> CacheResult<Option<Item>> {
        self.get_at(id, Instant::now())
    }

    /// [`get`](ReferenceAwareCache::get) with an explicit clock, for tests.
    pub fn get_at(&self, id: &BaseId, now: Instant) -> CacheResult<Option<Item>> {
        self.check_live()?;
        let mut inner = self.inner.lock().expect("lock poisoned");
        Ok(inner.entries.get_mut(id).map(|entry| {
            entry.touch(now, self.options.ttl);
            entry.item().clone()
        }))
    }

    /// Invoke `on_missing` for every reference in `base` whose target is
    /// not currently cached.
    pub fn scan_for_references(
        &self,
        base: &Base,
        on_missing: &mut dyn FnMut(&BaseId),
    ) -> CacheResult<()> {
        self.check_live()?;
        let inner = self.inner.lock().expect("lock poisoned");
        let mut seen = HashSet::new();
        scan_references(base, |id| {
            if seen.insert(id.clone()) && !inner.entries.contains_key(id) {
                on_missing(id);
            }
        });
        Ok(())
    }

    /// Eviction pass: remove expired, unreferenced entries in the
    /// deterministic [`eviction_order`] until the cache fits its budget.
    /// Returns how many entries were evicted.
    pub fn cleanup(&self, now: Instant) -> CacheResult<usize> {
        self.check_live()?;
        let mut inner = self.inner.lock().expect("lock poisoned");

        let mut candidates: Vec<EvictionCandidate> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, entry)| EvictionCandidate {
                id: id.clone(),
                size: entry.item().byte_size(),
                referenced: inner.referenced.get(id).copied().unwrap_or(0) > 0,
            })
            .collect();
        candidates.sort_by(eviction_order);

        let max_bytes = self.max_bytes();
        let mut evicted = 0;
        for candidate in candidates {
            if inner.total_bytes <= max_bytes {
                break;
            }
            // Reference protection: a live referrer pins its dependencies,
            // expired or not. The ordering puts all referenced candidates
            // last, so the first one we meet ends the pass.
            if candidate.referenced {
                break;
            }
            if let Some(entry) = inner.entries.remove(&candidate.id) {
                inner.total_bytes = inner.total_bytes.saturating_sub(candidate.size);
                for id in references_of(entry.item()) {
                    if let Some(count) = inner.referenced.get_mut(&id) {
                        *count -= 1;
                        if *count == 0 {
                            inner.referenced.remove(&id);
                        }
                    }
                }
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, total_bytes = inner.total_bytes, "cache eviction pass");
        }
        Ok(evicted)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cumulative payload bytes currently accounted.
    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").total_bytes
    }

    /// Drop all entries; every later operation fails with
    /// [`CacheError::Disposed`].
    pub fn dispose(&self) {
        self.disposed.store(true, AtomicOrdering::Release);
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.entries.clear();
        inner.referenced.clear();
        inner.total_bytes = 0;
    }

    fn max_bytes(&self) -> u64 {
        self.options.max_size_mb * 1024 * 1024
    }
}

/// Deduplicated reference targets of an item's document.
fn references_of(item: &Item) -> HashSet<BaseId> {
    let mut out = HashSet::new();
    if let Some(base) = &item.base {
        scan_references(base, |id| {
            out.insert(id.clone());
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_with_refs(id: &str, refs: &[&str]) -> Base {
        let children: Vec<_> = refs
            .iter()
            .map(|r| json!({ "speckle_type": "reference", "referencedId": r }))
            .collect();
        Base::from_json(json!({
            "id": id,
            "speckle_type": "Base",
            "children": children
        }))
        .unwrap()
    }

    fn item_with_refs(id: &str, size: u64, refs: &[&str]) -> Item {
        Item::resolved(base_with_refs(id, refs), Some(size))
    }

    fn no_missing() -> impl FnMut(&BaseId) {
        |_id: &BaseId| {}
    }

    /// Budget of a few bytes so inserts trigger eviction immediately.
    fn tiny_cache(ttl: Duration) -> ReferenceAwareCache {
        ReferenceAwareCache::new(CacheOptions {
            max_size_mb: 0,
            ttl,
        })
    }

    fn roomy_cache() -> ReferenceAwareCache {
        ReferenceAwareCache::new(CacheOptions::default())
    }

    // -----------------------------------------------------------------------
    // Insert / lookup
    // -----------------------------------------------------------------------

    #[test]
    fn add_then_get_roundtrips() {
        let cache = roomy_cache();
        let item = item_with_refs("a", 10, &[]);
        cache.add(&item, &mut no_missing()).unwrap();
        assert_eq!(cache.get(&BaseId::from("a")).unwrap(), Some(item));
    }

    #[test]
    fn get_misses_for_unknown_id() {
        let cache = roomy_cache();
        assert_eq!(cache.get(&BaseId::from("nope")).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_does_not_double_account() {
        let cache = roomy_cache();
        let item = item_with_refs("a", 10, &["b"]);
        cache.add(&item, &mut no_missing()).unwrap();
        cache.add(&item, &mut no_missing()).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 10);
    }

    #[test]
    fn add_reports_missing_references() {
        let cache = roomy_cache();
        cache
            .add(&item_with_refs("b", 1, &[]), &mut no_missing())
            .unwrap();

        let mut missing = Vec::new();
        cache
            .add(&item_with_refs("a", 1, &["b", "c"]), &mut |id| {
                missing.push(id.as_str().to_owned())
            })
            .unwrap();
        // b is cached; only c is missing.
        assert_eq!(missing, vec!["c"]);
    }

    #[test]
    fn scan_for_references_skips_cached_targets() {
        let cache = roomy_cache();
        cache
            .add(&item_with_refs("x", 1, &[]), &mut no_missing())
            .unwrap();

        let base = base_with_refs("parent", &["x", "y"]);
        let mut missing = Vec::new();
        cache
            .scan_for_references(&base, &mut |id| missing.push(id.as_str().to_owned()))
            .unwrap();
        assert_eq!(missing, vec!["y"]);
    }

    // -----------------------------------------------------------------------
    // Sliding TTL and eviction
    // -----------------------------------------------------------------------

    #[test]
    fn expired_unreferenced_entry_is_evicted() {
        let ttl = Duration::from_millis(100);
        let cache = tiny_cache(ttl);
        let now = Instant::now();
        cache
            .add_at(&item_with_refs("old", 10, &[]), &mut no_missing(), now)
            .unwrap();

        let later = now + Duration::from_millis(200);
        cache.cleanup(later).unwrap();
        assert_eq!(cache.get_at(&BaseId::from("old"), later).unwrap(), None);
    }

    #[test]
    fn expired_but_referenced_entry_is_retained() {
        let ttl = Duration::from_millis(100);
        let cache = tiny_cache(ttl);
        let now = Instant::now();

        // `dep` expires; `parent` (fresh) references it.
        cache
            .add_at(&item_with_refs("dep", 10, &[]), &mut no_missing(), now)
            .unwrap();
        let later = now + Duration::from_millis(200);
        cache
            .add_at(&item_with_refs("parent", 10, &["dep"]), &mut no_missing(), later)
            .unwrap();

        cache.cleanup(later).unwrap();
        assert!(cache.get_at(&BaseId::from("dep"), later).unwrap().is_some());
    }

    #[test]
    fn read_refreshes_ttl() {
        let ttl = Duration::from_millis(100);
        let cache = tiny_cache(ttl);
        let now = Instant::now();
        cache
            .add_at(&item_with_refs("a", 10, &[]), &mut no_missing(), now)
            .unwrap();

        // Touch at +90ms; without the touch it would expire at +100ms.
        let touch = now + Duration::from_millis(90);
        cache.get_at(&BaseId::from("a"), touch).unwrap();
        cache.cleanup(now + Duration::from_millis(150)).unwrap();
        assert!(cache
            .get_at(&BaseId::from("a"), now + Duration::from_millis(150))
            .unwrap()
            .is_some());
    }

    #[test]
    fn eviction_frees_reference_counts() {
        let ttl = Duration::from_millis(100);
        let cache = tiny_cache(ttl);
        let now = Instant::now();

        cache
            .add_at(&item_with_refs("dep", 10, &[]), &mut no_missing(), now)
            .unwrap();
        cache
            .add_at(&item_with_refs("parent", 10, &["dep"]), &mut no_missing(), now)
            .unwrap();

        // Both expire; parent goes first in some pass, after which dep is
        // unreferenced and evictable.
        let later = now + Duration::from_millis(200);
        cache.cleanup(later).unwrap();
        cache.cleanup(later).unwrap();
        assert_eq!(cache.len(), 0);
    }

    // -----------------------------------------------------------------------
    // Comparators
    // -----------------------------------------------------------------------

    fn candidate(id: &str, size: u64, referenced: bool) -> EvictionCandidate {
        EvictionCandidate {
            id: BaseId::from(id),
            size,
            referenced,
        }
    }

    #[test]
    fn unreferenced_sorts_before_referenced() {
        let free = candidate("a", 1, false);
        let pinned = candidate("b", 1, true);
        assert_eq!(compare_by_references(&free, &pinned), Ordering::Less);
        assert_eq!(compare_by_references(&pinned, &free), Ordering::Greater);
        assert_eq!(compare_by_references(&free, &free), Ordering::Equal);
    }

    #[test]
    fn larger_sorts_before_smaller() {
        let big = candidate("a", 100, false);
        let small = candidate("b", 1, false);
        assert_eq!(compare_by_size(&big, &small), Ordering::Less);
    }

    #[test]
    fn total_order_is_deterministic() {
        let mut candidates = vec![
            candidate("c", 5, true),
            candidate("b", 5, false),
            candidate("a", 5, false),
            candidate("d", 50, false),
        ];
        candidates.sort_by(eviction_order);
        let ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
        // Reference protection dominates, then size desc, then id asc.
        assert_eq!(ids, vec!["d", "a", "b", "c"]);
    }

    // -----------------------------------------------------------------------
    // Disposal
    // -----------------------------------------------------------------------

    #[test]
    fn operations_fail_after_dispose() {
        let cache = roomy_cache();
        cache
            .add(&item_with_refs("a", 1, &[]), &mut no_missing())
            .unwrap();
        cache.dispose();

        assert!(matches!(
            cache.get(&BaseId::from("a")),
            Err(CacheError::Disposed)
        ));
        assert!(matches!(
            cache.add(&item_with_refs("b", 1, &[]), &mut no_missing()),
            Err(CacheError::Disposed)
        ));
        assert!(matches!(
            cache.cleanup(Instant::now()),
            Err(CacheError::Disposed)
        ));
    }
}
