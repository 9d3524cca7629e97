use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content-addressed identifier for a base document.
///
/// A `BaseId` is the content hash of a document, assigned by the producer
/// (never by this system). Identical content always carries the same id,
/// making documents deduplicatable and permanently cacheable.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaseId(String);

impl BaseId {
    /// Wrap a producer-assigned hash string.
    ///
    /// Returns an error for the empty string, which can never name a
    /// document.
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        if id.is_empty() {
            return Err(TypeError::EmptyId);
        }
        Ok(Self(id))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }

    /// Short representation for log output (first 8 characters).
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Debug for BaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BaseId({})", self.short())
    }
}

impl fmt::Display for BaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BaseId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for BaseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for BaseId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
