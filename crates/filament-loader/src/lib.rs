//! Orchestration layer of the Filament object-graph loader.
//!
//! [`GraphLoader`] is the public entry point: given a root id it resolves
//! the full transitive reference closure — memory cache first, then the
//! persistent tier in batches, then the streaming network download — and
//! exposes the growing result set as a finite, non-restartable sequence of
//! items.
//!
//! The [`DefermentManager`] is what turns a flat stream of downloaded
//! documents into closure resolution: every resolved item is scanned for
//! references, every unknown referenced id registers a waiter and triggers
//! exactly one fetch. An id already cached, or already in flight, is never
//! re-requested — the invariant that keeps diamond-shaped graphs from
//! amplifying requests.
//!
//! No retries live here; a failed load is reported and the caller decides.

pub mod deferment;
pub mod error;
pub mod loader;
pub mod options;

pub use deferment::{Coverage, Deferred, DefermentManager};
pub use error::{LoaderError, LoaderResult};
pub use loader::{GraphLoader, LoadState};
pub use options::LoaderOptions;
