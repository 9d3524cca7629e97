use thiserror::Error;

use filament_types::BaseId;

/// Errors in the streamed wire format itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// A completed line had no tab separator. Fatal to the batch.
    #[error("malformed line in response: {preview}")]
    MalformedLine { preview: String },

    /// A frame id was not valid UTF-8. Fatal to the batch.
    #[error("invalid utf-8 in frame id: {0}")]
    InvalidId(String),

    /// One document failed to parse or validate. Fatal to that item only;
    /// the rest of the batch is unaffected.
    #[error("error parsing object {id}: {reason}")]
    InvalidItem { id: BaseId, reason: String },

    /// The stream ended mid-frame.
    #[error("response stream ended mid-frame ({len} trailing bytes)")]
    UnterminatedFrame { len: usize },
}

/// Errors from the download stage.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP 401/403. Fatal to the whole load, never retried here.
    #[error("access denied (status {status})")]
    AccessDenied { status: u16 },

    /// Any other non-2xx response. Fatal to the batch; the caller may
    /// retry the whole load.
    #[error("failed to fetch objects: status {status}")]
    Failed { status: u16 },

    /// Wire-format failure while parsing a response body.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A completed batch response never mentioned some requested ids.
    /// Lists at most the first ten for diagnostics.
    #[error("items requested were not downloaded ({total} missing): {missing:?}")]
    Integrity { missing: Vec<BaseId>, total: usize },

    /// Request could not be encoded.
    #[error("request encoding failed: {0}")]
    Encode(String),

    /// Network-level failure from the HTTP client (includes timeouts).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The downstream result queue is gone; the load was torn down.
    #[error("result queue closed mid-download")]
    OutputClosed,

    /// The batch pool was used before `initialize_pool`.
    #[error("download pool is not initialized")]
    PoolNotInitialized,
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
