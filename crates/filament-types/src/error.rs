use thiserror::Error;

/// Errors produced by data-model operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    /// The JSON value is not a structurally valid base document.
    #[error("not a valid base document: {0}")]
    InvalidBase(String),

    /// A base id must be a non-empty string.
    #[error("empty base id")]
    EmptyId,
}

/// Result alias for data-model operations.
pub type TypeResult<T> = Result<T, TypeError>;
