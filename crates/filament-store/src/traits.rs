use async_trait::async_trait;

use filament_types::{BaseId, Item};

use crate::error::StoreResult;

/// Batched key→document store.
///
/// All implementations must satisfy these invariants:
/// - Documents are immutable once written; writing the same id twice is a
///   no-op (content-addressing guarantees identical content).
/// - `get_all` preserves positional correspondence: result slot *i* answers
///   ids[*i*], with `None` for absent ids.
/// - After `dispose()`, every operation fails with `StoreError::Disposed`.
/// - I/O errors are propagated, never silently ignored.
#[async_trait]
pub trait ObjectDatabase: Send + Sync {
    /// Read a batch of items. Absent ids yield `None` in their slot.
    async fn get_all(&self, ids: &[BaseId]) -> StoreResult<Vec<Option<Item>>>;

    /// Write a batch of items. Idempotent per id.
    async fn put_all(&self, items: &[Item]) -> StoreResult<()>;

    /// One-time initialization hook, run before first use.
    ///
    /// Exists to isolate platform workarounds (stores whose connections
    /// stall until poked) from cache logic. Idempotent; the default does
    /// nothing.
    async fn warm_up(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Release the underlying connection. Further operations fail.
    async fn dispose(&self) -> StoreResult<()>;
}
