use thiserror::Error;

/// Errors from queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Any operation attempted after disposal.
    #[error("queue is disposed")]
    Disposed,

    /// The receiving side of a hand-off is gone.
    #[error("queue is closed")]
    Closed,
}

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
