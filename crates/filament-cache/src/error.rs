use thiserror::Error;

use filament_store::StoreError;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Any operation attempted after `dispose()`.
    #[error("cache is disposed")]
    Disposed,

    /// The writer hit a store failure and stopped accepting items.
    #[error("cache writer is in a failed state: {0}")]
    WriterFailed(String),

    /// Failure from the persistent store collaborator.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
