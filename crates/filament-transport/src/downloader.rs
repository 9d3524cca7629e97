use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, warn};

use filament_batch::{BatchPool, BatchPoolOptions, BatchProcessor, BoundedQueue};
use filament_types::{Base, BaseId, Item};

use crate::error::{TransportError, TransportResult, WireError};
use crate::parser::{WireParser, DETACHED_PAYLOAD_MARKER};
use crate::transport::ObjectTransport;

/// Closure downloads above this expected total use the staggered batch
/// policy; at or below it, a single batch covers everything.
const SINGLE_BATCH_THRESHOLD: usize = 50;

/// Staggered batch sizes for large closures: a modest opener while the
/// cache warms, a large middle to amortize round-trips, tapering at the
/// tail to avoid over-fetching stale requests.
const STAGGERED_SIZES: [usize; 4] = [10_000, 30_000, 10_000, 1_000];

/// Yield to the scheduler after this many parsed lines so one giant batch
/// cannot monopolize the executor.
const YIELD_EVERY: u64 = 1_000;

/// Batch size policy for an expected closure total. An unknown total gets
/// the staggered policy — the closure could be arbitrarily large.
pub fn batch_sizes(total: Option<usize>) -> Vec<usize> {
    match total {
        Some(total) if total <= SINGLE_BATCH_THRESHOLD => vec![total.max(1)],
        _ => STAGGERED_SIZES.to_vec(),
    }
}

/// One download-stage result: a resolved item, or the error that stands in
/// for it (per-item wire failures, batch-fatal transport failures).
pub type DownloadOutcome = Result<Item, TransportError>;

/// Tuning for the [`Downloader`].
#[derive(Clone, Debug)]
pub struct DownloaderOptions {
    /// A partially-filled batch dispatches at latest this long after its
    /// first id.
    pub max_batch_wait: Duration,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            max_batch_wait: Duration::from_millis(200),
        }
    }
}

/// Owns the HTTP round-trips of a load.
///
/// The root object goes through [`download_single`] (always exactly one
/// id, no batching). Child ids are queued with [`add`] into a
/// [`BatchPool`] whose workers POST id batches and stream-parse the
/// responses into the shared results queue. The pool is created by
/// [`initialize_pool`] once the expected closure size is known.
///
/// [`download_single`]: Downloader::download_single
/// [`add`]: Downloader::add
/// [`initialize_pool`]: Downloader::initialize_pool
pub struct Downloader {
    transport: Arc<dyn ObjectTransport>,
    results: Arc<BoundedQueue<DownloadOutcome>>,
    options: DownloaderOptions,
    pool: Mutex<Option<Arc<BatchPool<BaseId>>>>,
    cancelled: Arc<AtomicBool>,
}

impl Downloader {
    pub fn new(
        transport: Arc<dyn ObjectTransport>,
        results: Arc<BoundedQueue<DownloadOutcome>>,
        options: DownloaderOptions,
    ) -> Self {
        Self {
            transport,
            results,
            options,
            pool: Mutex::new(None),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create the batch pool, sized by the expected closure total (pass
    /// `None` when the root carries no closure table). Replaces any
    /// previous pool; call once per load.
    pub fn initialize_pool(&self, total: Option<usize>) {
        let sizes = batch_sizes(total);
        debug!(total, ?sizes, "initializing download pool");
        let runner = Arc::new(BatchRunner {
            transport: Arc::clone(&self.transport),
            results: Arc::clone(&self.results),
            cancelled: Arc::clone(&self.cancelled),
        });
        let pool = BatchPool::new(
            BatchPoolOptions {
                sizes,
                max_wait: self.options.max_batch_wait,
            },
            runner,
        );
        *self.pool.lock().expect("lock poisoned") = Some(Arc::new(pool));
    }

    /// Queue a child id for the next batch.
    ///
    /// Ids arriving after cancellation are dropped — no further fetches
    /// are issued for a cancelled load.
    pub fn add(&self, id: BaseId) -> TransportResult<()> {
        let pool = self
            .pool
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .cloned()
            .ok_or(TransportError::PoolNotInitialized)?;
        if pool.add(id).is_err() && !self.cancelled.load(Ordering::Acquire) {
            return Err(TransportError::PoolNotInitialized);
        }
        Ok(())
    }

    /// Fetch exactly one object through the dedicated single-object
    /// endpoint. Returns `None` for documents with detached payloads.
    pub async fn download_single(&self, id: &BaseId) -> TransportResult<Option<Item>> {
        let text = self.transport.fetch_single(id).await?;
        let bytes = text.as_bytes();
        if bytes
            .windows(DETACHED_PAYLOAD_MARKER.len())
            .any(|w| w == DETACHED_PAYLOAD_MARKER)
        {
            return Ok(None);
        }

        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| WireError::InvalidItem {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        let base = Base::from_json(value).map_err(|e| WireError::InvalidItem {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(Item::resolved(base, Some(bytes.len() as u64))))
    }

    /// Stop dispatching and discard queued ids. In-flight responses finish
    /// parsing but the load's consumer is already gone.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(pool) = self.pool.lock().expect("lock poisoned").as_ref() {
            pool.cancel();
        }
    }

    /// Drain queued ids through a final flush and wait for the workers.
    pub async fn dispose_async(&self) -> TransportResult<()> {
        let pool = self.pool.lock().expect("lock poisoned").take();
        if let Some(pool) = pool {
            let _ = pool.dispose_async().await;
        }
        Ok(())
    }
}

/// Per-batch round-trip: fetch, stream-parse, verify completeness.
struct BatchRunner {
    transport: Arc<dyn ObjectTransport>,
    results: Arc<BoundedQueue<DownloadOutcome>>,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl BatchProcessor<BaseId> for BatchRunner {
    async fn process(&self, batch: Vec<BaseId>) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if let Err(error) = self.run(batch).await {
            if self.cancelled.load(Ordering::Acquire) {
                // Results of a cancelled load are discarded, errors
                // included.
                return;
            }
            warn!(%error, "batch download failed");
            // The error stands in for the batch in the result stream; if
            // the queue is gone the load has already been torn down.
            let _ = self.results.push(Err(error)).await;
        }
    }
}

impl BatchRunner {
    async fn run(&self, batch: Vec<BaseId>) -> TransportResult<()> {
        let mut missing: HashSet<BaseId> = batch.iter().cloned().collect();
        let mut stream = self.transport.fetch_batch(&batch).await?;
        let mut parser = WireParser::new();
        let mut processed = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if self.cancelled.load(Ordering::Acquire) {
                // Stop yielding items for a cancelled load.
                return Ok(());
            }
            for outcome in parser.feed(&chunk)? {
                processed += 1;
                if processed % YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
                match outcome {
                    Ok(item) => {
                        missing.remove(&item.base_id);
                        // Id-only items (detached payloads) count as
                        // observed but carry nothing to emit.
                        if item.is_resolved() {
                            self.results
                                .push(Ok(item))
                                .await
                                .map_err(|_| TransportError::OutputClosed)?;
                        }
                    }
                    Err(error) => {
                        if let WireError::InvalidItem { id, .. } = &error {
                            missing.remove(id);
                        }
                        self.results
                            .push(Err(error.into()))
                            .await
                            .map_err(|_| TransportError::OutputClosed)?;
                    }
                }
            }
        }
        parser.finish()?;

        if !missing.is_empty() {
            let total = missing.len();
            let mut missing: Vec<BaseId> = missing.into_iter().collect();
            missing.sort();
            missing.truncate(10);
            return Err(TransportError::Integrity { missing, total });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::collections::HashMap;

    use crate::transport::ByteStream;

    fn doc(id: &str) -> String {
        format!(r#"{{"id":"{id}","speckle_type":"Base"}}"#)
    }

    /// Replays canned documents as wire frames, split into fixed-size
    /// chunks to exercise boundary handling.
    struct FakeTransport {
        docs: HashMap<String, String>,
        chunk_size: usize,
        status: Option<u16>,
    }

    impl FakeTransport {
        fn new(docs: &[(&str, String)]) -> Self {
            Self {
                docs: docs
                    .iter()
                    .map(|(id, doc)| (id.to_string(), doc.clone()))
                    .collect(),
                chunk_size: 7,
                status: None,
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                docs: HashMap::new(),
                chunk_size: 7,
                status: Some(status),
            }
        }
    }

    #[async_trait]
    impl ObjectTransport for FakeTransport {
        async fn fetch_batch(&self, ids: &[BaseId]) -> TransportResult<ByteStream> {
            if let Some(status) = self.status {
                return Err(if status == 401 || status == 403 {
                    TransportError::AccessDenied { status }
                } else {
                    TransportError::Failed { status }
                });
            }
            let mut body = Vec::new();
            for id in ids {
                if let Some(doc) = self.docs.get(id.as_str()) {
                    body.extend(format!("{id}\t{doc}\n").into_bytes());
                }
            }
            let chunks: Vec<TransportResult<bytes::Bytes>> = body
                .chunks(self.chunk_size)
                .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }

        async fn fetch_single(&self, id: &BaseId) -> TransportResult<String> {
            self.docs
                .get(id.as_str())
                .cloned()
                .ok_or(TransportError::Failed { status: 404 })
        }
    }

    fn make_downloader(transport: FakeTransport) -> (Downloader, Arc<BoundedQueue<DownloadOutcome>>) {
        let results = Arc::new(BoundedQueue::new(64));
        let downloader = Downloader::new(
            Arc::new(transport),
            Arc::clone(&results),
            DownloaderOptions {
                max_batch_wait: Duration::from_millis(10),
            },
        );
        (downloader, results)
    }

    #[tokio::test]
    async fn downloads_batch_into_results_queue() {
        let transport = FakeTransport::new(&[("a", doc("a")), ("b", doc("b"))]);
        let (downloader, results) = make_downloader(transport);
        downloader.initialize_pool(Some(2));

        downloader.add(BaseId::from("a")).unwrap();
        downloader.add(BaseId::from("b")).unwrap();
        downloader.dispose_async().await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let item = results.pop().await.unwrap().unwrap();
            ids.push(item.base_id.as_str().to_owned());
        }
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn missing_ids_produce_integrity_error() {
        let transport = FakeTransport::new(&[("a", doc("a"))]);
        let (downloader, results) = make_downloader(transport);
        downloader.initialize_pool(Some(2));

        downloader.add(BaseId::from("a")).unwrap();
        downloader.add(BaseId::from("ghost")).unwrap();
        downloader.dispose_async().await.unwrap();

        let mut saw_integrity = false;
        while let Some(outcome) = results.pop().await {
            if let Err(TransportError::Integrity { missing, total }) = outcome {
                assert_eq!(total, 1);
                assert_eq!(missing[0].as_str(), "ghost");
                saw_integrity = true;
                break;
            }
        }
        assert!(saw_integrity);
    }

    #[tokio::test]
    async fn bad_document_is_per_item_error_not_batch_abort() {
        let transport = FakeTransport::new(&[("bad", "{not json".to_owned()), ("ok", doc("ok"))]);
        let (downloader, results) = make_downloader(transport);
        downloader.initialize_pool(Some(2));

        downloader.add(BaseId::from("bad")).unwrap();
        downloader.add(BaseId::from("ok")).unwrap();
        downloader.dispose_async().await.unwrap();

        let mut errors = 0;
        let mut items = 0;
        for _ in 0..2 {
            match results.pop().await.unwrap() {
                Ok(item) => {
                    assert_eq!(item.base_id.as_str(), "ok");
                    items += 1;
                }
                Err(TransportError::Wire(WireError::InvalidItem { id, .. })) => {
                    assert_eq!(id.as_str(), "bad");
                    errors += 1;
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!((items, errors), (1, 1));
    }

    #[tokio::test]
    async fn access_denied_surfaces_in_results() {
        let (downloader, results) = make_downloader(FakeTransport::failing(403));
        downloader.initialize_pool(Some(1));

        downloader.add(BaseId::from("a")).unwrap();
        downloader.dispose_async().await.unwrap();

        let outcome = results.pop().await.unwrap();
        assert!(matches!(
            outcome,
            Err(TransportError::AccessDenied { status: 403 })
        ));
    }

    #[tokio::test]
    async fn download_single_parses_document() {
        let (downloader, _results) = make_downloader(FakeTransport::new(&[("root", doc("root"))]));
        let item = downloader
            .download_single(&BaseId::from("root"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.base_id.as_str(), "root");
        assert!(item.is_resolved());
    }

    #[tokio::test]
    async fn download_single_skips_detached_payloads() {
        let raw = r#"{"id":"r","speckle_type":"Objects.Other.RawEncoding"}"#.to_owned();
        let (downloader, _results) = make_downloader(FakeTransport::new(&[("r", raw)]));
        let item = downloader.download_single(&BaseId::from("r")).await.unwrap();
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn add_requires_initialized_pool() {
        let (downloader, _results) = make_downloader(FakeTransport::new(&[]));
        assert!(matches!(
            downloader.add(BaseId::from("a")),
            Err(TransportError::PoolNotInitialized)
        ));
    }

    #[tokio::test]
    async fn cancel_drops_queued_ids() {
        let transport = FakeTransport::new(&[("a", doc("a"))]);
        let (downloader, results) = make_downloader(transport);
        downloader.initialize_pool(Some(60)); // staggered policy, nothing dispatches instantly

        downloader.add(BaseId::from("a")).unwrap();
        downloader.cancel();
        downloader.dispose_async().await.unwrap();
        results.finish();

        assert_eq!(results.pop().await.map(|r| r.is_ok()), None);
    }

    #[test]
    fn batch_size_policy() {
        assert_eq!(batch_sizes(Some(1)), vec![1]);
        assert_eq!(batch_sizes(Some(50)), vec![50]);
        assert_eq!(batch_sizes(Some(51)), vec![10_000, 30_000, 10_000, 1_000]);
        assert_eq!(batch_sizes(None), vec![10_000, 30_000, 10_000, 1_000]);
        assert_eq!(batch_sizes(Some(0)), vec![1]);
    }
}
