use thiserror::Error;

use filament_types::BaseId;

/// Aggregate error for loader operations.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Download or wire failure (access denied, transport, integrity,
    /// per-item protocol errors).
    #[error(transparent)]
    Transport(#[from] filament_transport::TransportError),

    /// Cache tier failure.
    #[error(transparent)]
    Cache(#[from] filament_cache::CacheError),

    /// Persistent store failure.
    #[error(transparent)]
    Store(#[from] filament_store::StoreError),

    /// Any operation attempted after `dispose()`.
    #[error("loader is disposed")]
    Disposed,

    /// The load (or the waiter's resolution path) was torn down.
    #[error("load was cancelled")]
    Cancelled,

    /// `load()` while a previous load is still streaming.
    #[error("a load is already in progress")]
    LoadInProgress,

    /// The root document exists but carries nothing loadable.
    #[error("root object {0} is unavailable")]
    RootUnavailable(BaseId),
}

/// Result alias for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;
