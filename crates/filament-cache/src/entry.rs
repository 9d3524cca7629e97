use std::time::{Duration, Instant};

use filament_types::Item;

/// A cached item plus its sliding expiry.
///
/// The owning cache tier is the sole mutator: every read refreshes
/// `expires_at` (sliding TTL, as opposed to fixed absolute expiry).
#[derive(Clone, Debug)]
pub struct CacheEntry {
    item: Item,
    expires_at: Instant,
}

impl CacheEntry {
    pub fn new(item: Item, now: Instant, ttl: Duration) -> Self {
        Self {
            item,
            expires_at: now + ttl,
        }
    }

    pub fn item(&self) -> &Item {
        &self.item
    }

    /// Push the expiry forward; called on every read.
    pub fn touch(&mut self, now: Instant, ttl: Duration) {
        self.expires_at = now + ttl;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}
