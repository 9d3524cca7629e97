//! Persistent storage collaborators for the Filament loader.
//!
//! The loader's durable cache tier talks to any store implementing
//! [`ObjectDatabase`]: a key→document store with batched reads and writes.
//! Two backends ship here:
//!
//! - [`InMemoryDatabase`] — `HashMap`-based store for tests and embedding
//! - [`SqliteDatabase`] — embedded durable backend
//!
//! # Design Rules
//!
//! 1. Stored items are immutable (content-addressing guarantees this), so
//!    writes are idempotent and concurrent reads are always safe.
//! 2. The store never interprets document contents — it is a pure
//!    key-value store.
//! 3. Platform quirks (connection warm-up) live behind [`ObjectDatabase::warm_up`],
//!    never in cache logic.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryDatabase;
pub use sqlite::SqliteDatabase;
pub use traits::ObjectDatabase;
