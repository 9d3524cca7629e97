use filament_cache::{CacheOptions, CacheWriterOptions, PersistentCacheOptions};
use filament_transport::DownloaderOptions;

/// Configuration for a [`GraphLoader`](crate::GraphLoader).
///
/// The defaults are tuned for large closures over a reasonably fast
/// connection; every knob exists because some deployment needed it.
#[derive(Clone, Debug)]
pub struct LoaderOptions {
    /// Memory tier tuning (size budget, sliding TTL).
    pub memory: CacheOptions,
    /// Persistent tier tuning (read batching, hot-index TTL).
    pub persistent: PersistentCacheOptions,
    /// Write-behind batching.
    pub writer: CacheWriterOptions,
    /// Download batching.
    pub downloader: DownloaderOptions,
    /// Capacity of the download→orchestrator hand-off queue; filling it
    /// suspends the download stage (backpressure).
    pub results_capacity: usize,
    /// Capacity of the consumer-facing result stream; filling it suspends
    /// the whole pipeline until the consumer catches up.
    pub stream_capacity: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            memory: CacheOptions::default(),
            persistent: PersistentCacheOptions::default(),
            writer: CacheWriterOptions::default(),
            downloader: DownloaderOptions::default(),
            results_capacity: 1024,
            stream_capacity: 256,
        }
    }
}
