use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{TypeError, TypeResult};
use crate::id::BaseId;

/// Discriminator value marking an in-document reference to another base.
pub const REFERENCE_DISCRIMINATOR: &str = "reference";

/// Field carrying the closure table on root documents: a map from every id
/// in the root's transitive closure to its depth.
const CLOSURE_FIELD: &str = "__closure__";

/// An immutable, content-addressed JSON document.
///
/// `id` is the content hash assigned by the producer; `speckle_type` is a
/// structural discriminator the loader only consults to detect reference
/// markers. All remaining fields are carried verbatim in `extra` — the
/// loader never interprets them beyond scanning for references.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Base {
    pub id: BaseId,
    pub speckle_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Base {
    /// Validate a parsed JSON value as a base document.
    ///
    /// This is the single structural check at the JSON boundary: the value
    /// must be an object carrying a non-empty string `id` and a string
    /// `speckle_type`. Past this point the typed struct is authoritative.
    pub fn from_json(value: Value) -> TypeResult<Self> {
        let base: Base = serde_json::from_value(value)
            .map_err(|e| TypeError::InvalidBase(e.to_string()))?;
        if base.id.as_str().is_empty() {
            return Err(TypeError::EmptyId);
        }
        Ok(base)
    }

    /// The closure table, if this document carries one.
    ///
    /// Root documents may list their full transitive closure as a map from
    /// id to depth. Entries with non-numeric depths are skipped.
    pub fn closure(&self) -> Option<BTreeMap<BaseId, i64>> {
        let table = self.extra.get(CLOSURE_FIELD)?.as_object()?;
        let mut out = BTreeMap::new();
        for (id, depth) in table {
            if id.is_empty() {
                continue;
            }
            if let Some(depth) = depth.as_i64() {
                out.insert(BaseId::from(id.as_str()), depth);
            }
        }
        Some(out)
    }

    /// Ids from the closure table, deepest first.
    ///
    /// Depth ordering front-loads the leaves shared by many parents; ties
    /// break by id so the request order is deterministic.
    pub fn closure_ids(&self) -> Option<Vec<BaseId>> {
        let table = self.closure()?;
        let mut ids: Vec<(BaseId, i64)> = table.into_iter().collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Some(ids.into_iter().map(|(id, _)| id).collect())
    }
}
