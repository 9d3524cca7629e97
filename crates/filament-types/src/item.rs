use serde::{Deserialize, Serialize};

use crate::base::Base;
use crate::id::BaseId;

/// The loader's working unit: a base id plus, once fetched, its document.
///
/// `base` is `None` only in the window between an id being referenced and
/// its document arriving. `size` is the byte length of the serialized
/// payload and drives cache accounting; items materialized without going
/// over the wire carry `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub base_id: BaseId,
    pub base: Option<Base>,
    pub size: Option<u64>,
}

impl Item {
    /// An item whose document has been fetched.
    pub fn resolved(base: Base, size: Option<u64>) -> Self {
        Self {
            base_id: base.id.clone(),
            base: Some(base),
            size,
        }
    }

    /// A known id whose document has not arrived yet.
    pub fn pending(base_id: BaseId) -> Self {
        Self {
            base_id,
            base: None,
            size: None,
        }
    }

    /// Whether the document is present.
    pub fn is_resolved(&self) -> bool {
        self.base.is_some()
    }

    /// Byte size used for cache accounting (zero when unknown).
    pub fn byte_size(&self) -> u64 {
        self.size.unwrap_or(0)
    }
}
