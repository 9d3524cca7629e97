//! Core data model for the Filament object-graph loader.
//!
//! The atomic unit is the [`Base`]: an immutable, content-addressed JSON
//! document identified by a producer-assigned hash ([`BaseId`]). A base may
//! embed [`Reference`] markers at any nesting depth; the set of bases
//! reachable from a root via references forms a DAG (the root's *closure*).
//!
//! # Design Rules
//!
//! 1. A base, once resolved, never changes — content-addressing guarantees
//!    this, so caches may treat presence as permanently valid.
//! 2. Structural validation happens once, at the JSON boundary
//!    ([`Base::from_json`]); everything past the boundary works with the
//!    concrete typed struct.
//! 3. Reference detection is an explicit recursive visitor over the generic
//!    JSON value — references can appear at arbitrary depth, so this is
//!    intrinsic to the format, not an implementation shortcut.

pub mod base;
pub mod error;
pub mod id;
pub mod item;
pub mod scan;

// Re-export primary types at crate root for ergonomic imports.
pub use base::{Base, REFERENCE_DISCRIMINATOR};
pub use error::{TypeError, TypeResult};
pub use id::BaseId;
pub use item::Item;
pub use scan::{scan_references, Reference};
