//! Queue primitives for the Filament loader pipeline.
//!
//! Three building blocks, all cooperative and bounded:
//!
//! - [`BatchingQueue`] — time/size-bounded coalescer: items trickle in via
//!   a non-blocking `add`, batches come out on a channel when the batch is
//!   full or the wait deadline lapses.
//! - [`BoundedQueue`] — FIFO hand-off between pipeline stages with
//!   backpressure and an explicit finished marker.
//! - [`BatchPool`] — a set of workers draining one shared id queue, each
//!   worker flushing batches of its own target size with at most one
//!   in-flight round-trip per worker.
//!
//! Disposal everywhere is drain-then-stop: pending items are flushed, never
//! silently dropped, unless the caller explicitly cancels.

pub mod batching;
pub mod bounded;
pub mod error;
pub mod pool;

pub use batching::{BatchingQueue, BatchingQueueOptions};
pub use bounded::BoundedQueue;
pub use error::{QueueError, QueueResult};
pub use pool::{BatchPool, BatchPoolOptions, BatchProcessor};
