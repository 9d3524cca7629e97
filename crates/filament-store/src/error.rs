use thiserror::Error;

/// Errors from object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Any operation attempted after `dispose()`.
    #[error("store is disposed")]
    Disposed,

    /// A stored document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error from the embedded database backend.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A blocking store task failed to complete.
    #[error("store task failed: {0}")]
    TaskFailed(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
