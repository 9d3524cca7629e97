//! Two-tier item caching for the Filament loader.
//!
//! The memory tier is a [`ReferenceAwareCache`]: sliding-TTL entries with
//! size-triggered eviction that never removes an entry while another cached
//! item still references it — evicting a shared dependency would force a
//! cascading re-fetch.
//!
//! The persistent tier is a [`PersistentCache`]: a batched read-through
//! facade over an [`ObjectDatabase`](filament_store::ObjectDatabase), with
//! a session-local hot index obeying the same TTL/reference discipline.
//! [`CacheWriter`] moves freshly-resolved items into the store in batches,
//! off the hot path, and fails fast on store errors — batched writes are
//! best-effort acceleration, the server stays authoritative.

pub mod entry;
pub mod error;
pub mod persistent;
pub mod reference_aware;
pub mod writer;

pub use entry::CacheEntry;
pub use error::{CacheError, CacheResult};
pub use persistent::{PersistentCache, PersistentCacheOptions, ReadRouter};
pub use reference_aware::{
    compare_by_references, compare_by_size, eviction_order, CacheOptions, EvictionCandidate,
    ReferenceAwareCache,
};
pub use writer::{CacheWriter, CacheWriterOptions};

/// The memory tier of a loader is a plain [`ReferenceAwareCache`].
pub type MemoryCache = ReferenceAwareCache;
