use serde_json::Value;

use crate::base::{Base, REFERENCE_DISCRIMINATOR};
use crate::id::BaseId;

/// An in-document pointer to another base.
///
/// On the wire a reference is the object
/// `{"speckle_type": "reference", "referencedId": "<id>"}` and may appear
/// at any nesting depth inside a base's fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub referenced_id: BaseId,
}

impl Reference {
    /// Detect a reference marker in a JSON value.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.get("speckle_type")?.as_str()? != REFERENCE_DISCRIMINATOR {
            return None;
        }
        let id = obj.get("referencedId")?.as_str()?;
        if id.is_empty() {
            return None;
        }
        Some(Self {
            referenced_id: BaseId::from(id),
        })
    }
}

/// Walk a base's fields and invoke `visit` for every reference found.
///
/// The walk is depth-first over objects and arrays. Reference markers are
/// terminal: their own fields are not descended into. A referenced id may
/// be visited more than once if the document repeats it; deduplication is
/// the caller's concern.
pub fn scan_references(base: &Base, mut visit: impl FnMut(&BaseId)) {
    for value in base.extra.values() {
        scan_value(value, &mut visit);
    }
}

fn scan_value(value: &Value, visit: &mut impl FnMut(&BaseId)) {
    match value {
        Value::Object(obj) => {
            if let Some(reference) = Reference::from_value(value) {
                visit(&reference.referenced_id);
                return;
            }
            for nested in obj.values() {
                scan_value(nested, visit);
            }
        }
        Value::Array(items) => {
            for nested in items {
                scan_value(nested, visit);
            }
        }
        _ => {}
    }
}
