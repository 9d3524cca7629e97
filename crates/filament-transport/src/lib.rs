//! Wire protocol and download stage for the Filament loader.
//!
//! The server streams a closure as newline-terminated frames, each
//! `<baseId> TAB <json-document>`; [`WireParser`] decodes that format
//! incrementally from raw byte chunks, tolerating frames split anywhere —
//! mid-line, mid-tab, mid-multibyte-character.
//!
//! [`Downloader`] owns the HTTP round-trips: a dedicated single-object
//! fetch for roots, and an adaptive [`BatchPool`] of batched closure
//! fetches whose parsed items land in a shared [`BoundedQueue`]. The
//! network seam is the [`ObjectTransport`] trait; [`HttpTransport`] is the
//! production implementation.
//!
//! No retries happen at this layer: 401/403 is fatal to the whole load,
//! any other failure is fatal to its batch and left to the caller.
//!
//! [`BatchPool`]: filament_batch::BatchPool
//! [`BoundedQueue`]: filament_batch::BoundedQueue

pub mod downloader;
pub mod endpoint;
pub mod error;
pub mod parser;
pub mod transport;

pub use downloader::{batch_sizes, DownloadOutcome, Downloader, DownloaderOptions};
pub use endpoint::Endpoints;
pub use error::{TransportError, TransportResult, WireError};
pub use parser::{LineOutcome, WireParser};
pub use transport::{ByteStream, HttpTransport, HttpTransportOptions, ObjectTransport};
