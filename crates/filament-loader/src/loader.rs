use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use filament_batch::BoundedQueue;
use filament_cache::{
    CacheError, CacheWriter, MemoryCache, PersistentCache, ReadRouter, ReferenceAwareCache,
};
use filament_store::ObjectDatabase;
use filament_transport::{
    DownloadOutcome, Downloader, ObjectTransport, TransportError, WireError,
};
use filament_types::{BaseId, Item};

use crate::deferment::{Coverage, DefermentManager};
use crate::error::{LoaderError, LoaderResult};
use crate::options::LoaderOptions;

/// Lifecycle of one root load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    /// Cache-checking, then fetching, the root object.
    ResolvingRoot,
    /// The deferment fan-out is resolving the transitive closure.
    StreamingClosure,
    /// No waiters remain and no fetch is in flight.
    Draining,
    /// Terminal success.
    Settled,
    /// Terminal failure (batch-fatal download error).
    Failed,
    /// Terminal, by explicit caller cancellation.
    Cancelled,
}

/// Routes persistent-tier read results: hits join the download result
/// stream, misses fall through to the network.
struct Router {
    results: Arc<BoundedQueue<DownloadOutcome>>,
    downloader: Arc<Downloader>,
}

#[async_trait]
impl ReadRouter for Router {
    async fn on_hit(&self, item: Item) {
        let _ = self.results.push(Ok(item)).await;
    }

    async fn on_miss(&self, id: BaseId) {
        if let Err(error) = self.downloader.add(id) {
            warn!(%error, "could not forward cache miss to downloader");
        }
    }
}

struct Core {
    store: Arc<dyn ObjectDatabase>,
    memory: Arc<MemoryCache>,
    persistent: PersistentCache,
    writer: CacheWriter,
    deferments: DefermentManager,
    downloader: Arc<Downloader>,
    results: Arc<BoundedQueue<DownloadOutcome>>,
    consumer: Mutex<Option<mpsc::Sender<LoaderResult<Item>>>>,
    emitted: Mutex<HashSet<BaseId>>,
    state: Mutex<LoadState>,
    /// Per-load shutdown signal; replaced on every `load()` so a permit
    /// from one load's teardown can never leak into the next.
    shutdown: Mutex<Arc<Notify>>,
    cancelled: AtomicBool,
    disposed: AtomicBool,
    stream_capacity: usize,
}

impl Core {
    fn check_live(&self) -> LoaderResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(LoaderError::Disposed);
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown.lock().expect("lock poisoned"))
    }

    fn set_state(&self, state: LoadState) {
        *self.state.lock().expect("lock poisoned") = state;
    }

    fn state(&self) -> LoadState {
        *self.state.lock().expect("lock poisoned")
    }

    fn mark_emitted(&self, id: &BaseId) -> bool {
        self.emitted.lock().expect("lock poisoned").insert(id.clone())
    }

    fn is_emitted(&self, id: &BaseId) -> bool {
        self.emitted.lock().expect("lock poisoned").contains(id)
    }

    /// Hand a result to the consumer, suspending while the stream buffer
    /// is full. A dropped stream means the load was abandoned: stop
    /// issuing fetches and let the driver wind down. Shutdown interrupts a
    /// blocked hand-over.
    async fn emit(&self, result: LoaderResult<Item>) {
        let sender = self.consumer.lock().expect("lock poisoned").clone();
        let Some(sender) = sender else { return };
        let shutdown = self.shutdown_handle();
        tokio::select! {
            sent = sender.send(result) => {
                if sent.is_err() {
                    debug!("result stream dropped; abandoning load");
                    self.cancelled.store(true, Ordering::Release);
                    self.downloader.cancel();
                    self.set_state(LoadState::Cancelled);
                    self.deferments.clear();
                    self.consumer.lock().expect("lock poisoned").take();
                    shutdown.notify_one();
                }
            }
            _ = shutdown.notified() => {}
        }
    }

    /// Fold one resolved item — and, transitively, any of its references
    /// already sitting in the memory cache — into the load: persist it,
    /// fulfill waiters, fan out fetches for unknown references, and emit.
    async fn process_resolved(&self, item: Item) {
        if self.is_cancelled() {
            return;
        }
        let mut worklist = VecDeque::from([item]);
        while let Some(item) = worklist.pop_front() {
            if self.is_cancelled() {
                return;
            }
            if !self.mark_emitted(&item.base_id) {
                continue;
            }
            if let Err(error) = self.writer.add(item.clone()) {
                if !matches!(error, CacheError::Disposed) {
                    warn!(%error, "write-behind rejected item");
                }
            }

            let mut to_request = Vec::new();
            let cached_refs =
                match self.deferments.undefer(&item, &mut |id| to_request.push(id.clone())) {
                    Ok(cached) => cached,
                    Err(_) => return,
                };
            for id in to_request {
                if let Err(error) = self.persistent.request(id) {
                    warn!(%error, "could not queue persistent lookup");
                }
            }

            self.emit(Ok(item)).await;
            for cached in cached_refs {
                if !self.is_emitted(&cached.base_id) {
                    worklist.push_back(cached);
                }
            }
        }
    }

    /// Cover one id from the root's closure table.
    async fn cover(&self, id: &BaseId) {
        match self.deferments.ensure(id) {
            Ok(Coverage::Cached(item)) => {
                if !self.is_emitted(&item.base_id) {
                    self.process_resolved(item).await;
                }
            }
            Ok(Coverage::Registered) => {
                if let Err(error) = self.persistent.request(id.clone()) {
                    warn!(%error, "could not queue persistent lookup");
                }
            }
            Ok(Coverage::InFlight) | Err(_) => {}
        }
    }

    /// One download-stage error. Per-item wire errors ride the stream and
    /// release their waiter; anything else is fatal to the load. Returns
    /// `true` when the load is terminally failed.
    async fn process_error(&self, error: TransportError) -> bool {
        match &error {
            TransportError::Wire(WireError::InvalidItem { id, .. }) => {
                self.deferments.fail(id);
                self.emit(Err(error.into())).await;
                false
            }
            _ => {
                self.emit(Err(error.into())).await;
                warn!("load failed");
                self.set_state(LoadState::Failed);
                self.downloader.cancel();
                self.deferments.clear();
                self.consumer.lock().expect("lock poisoned").take();
                true
            }
        }
    }

    /// Terminal-success check: no waiters outstanding means nothing is in
    /// flight (every queued fetch holds a registration until resolved).
    fn try_settle(&self) -> bool {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if *state != LoadState::StreamingClosure {
                return false;
            }
            if self.deferments.outstanding_len() > 0 {
                return false;
            }
            *state = LoadState::Draining;
        }
        // Close the stream while draining; write-behind flushing finishes
        // in the background and is only awaited at dispose.
        self.consumer.lock().expect("lock poisoned").take();
        self.set_state(LoadState::Settled);
        info!("load settled");
        true
    }
}

async fn run_driver(core: Arc<Core>, root: Item) {
    core.process_resolved(root.clone()).await;
    if let Some(ids) = root.base.as_ref().and_then(|b| b.closure_ids()) {
        for id in ids {
            core.cover(&id).await;
        }
    }
    if core.try_settle() {
        return;
    }

    let shutdown = core.shutdown_handle();
    loop {
        // A wakeup may race the condition it signals; the re-check at the
        // top makes spurious wakeups harmless.
        if core.is_cancelled()
            || matches!(
                core.state(),
                LoadState::Settled | LoadState::Failed | LoadState::Cancelled
            )
        {
            break;
        }
        tokio::select! {
            outcome = core.results.pop() => {
                let Some(outcome) = outcome else { break };
                match outcome {
                    // An item nobody registered belongs to an abandoned
                    // load (or is a duplicate frame); drop it.
                    Ok(item) if !core.deferments.is_outstanding(&item.base_id) => {}
                    Ok(item) => core.process_resolved(item).await,
                    Err(error) => {
                        if core.process_error(error).await {
                            break;
                        }
                    }
                }
                if core.try_settle() {
                    break;
                }
            }
            _ = shutdown.notified() => {}
        }
    }
}

/// Public entry point: resolves object graphs rooted at a given id.
///
/// `load` drives the full pipeline — memory cache, batched persistent
/// reads, streaming network download — and yields the closure as a finite,
/// non-restartable sequence. `get_item` answers single lookups with the
/// same cache-first discipline. One loader serves one stream/token pair;
/// loads run one at a time.
pub struct GraphLoader {
    core: Arc<Core>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl GraphLoader {
    pub fn new(
        transport: Arc<dyn ObjectTransport>,
        store: Arc<dyn ObjectDatabase>,
        options: LoaderOptions,
    ) -> Self {
        let results = Arc::new(BoundedQueue::new(options.results_capacity));
        let downloader = Arc::new(Downloader::new(
            transport,
            Arc::clone(&results),
            options.downloader.clone(),
        ));
        let router = Arc::new(Router {
            results: Arc::clone(&results),
            downloader: Arc::clone(&downloader),
        });
        let persistent =
            PersistentCache::new(Arc::clone(&store), options.persistent.clone(), router);
        let memory = Arc::new(ReferenceAwareCache::new(options.memory.clone()));
        let writer = CacheWriter::new(Arc::clone(&store), options.writer.clone());
        let deferments = DefermentManager::new(Arc::clone(&memory));

        Self {
            core: Arc::new(Core {
                store,
                memory,
                persistent,
                writer,
                deferments,
                downloader,
                results,
                consumer: Mutex::new(None),
                emitted: Mutex::new(HashSet::new()),
                state: Mutex::new(LoadState::Idle),
                shutdown: Mutex::new(Arc::new(Notify::new())),
                cancelled: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                stream_capacity: options.stream_capacity,
            }),
            driver: Mutex::new(None),
        }
    }

    /// Current load lifecycle state.
    pub fn state(&self) -> LoadState {
        self.core.state()
    }

    /// Resolve the graph rooted at `root_id` and stream its items.
    ///
    /// The sequence is finite and not restartable: once consumed, a fresh
    /// `load` call re-traverses. Per-item protocol failures appear as
    /// `Err` elements without ending the sequence; batch-fatal failures
    /// end it.
    pub async fn load(
        &self,
        root_id: &BaseId,
    ) -> LoaderResult<ReceiverStream<LoaderResult<Item>>> {
        let core = &self.core;
        core.check_live()?;

        {
            let mut state = core.state.lock().expect("lock poisoned");
            let consumer_alive = core
                .consumer
                .lock()
                .expect("lock poisoned")
                .as_ref()
                .map(|tx| !tx.is_closed())
                .unwrap_or(false);
            match *state {
                LoadState::ResolvingRoot | LoadState::StreamingClosure | LoadState::Draining
                    if consumer_alive =>
                {
                    return Err(LoaderError::LoadInProgress)
                }
                _ => *state = LoadState::ResolvingRoot,
            }
        }

        // Wind down any abandoned previous driver before reusing shared
        // state, then start this load with a fresh shutdown signal.
        let previous = self.driver.lock().expect("lock poisoned").take();
        if let Some(previous) = previous {
            core.shutdown_handle().notify_one();
            let _ = previous.await;
        }
        *core.shutdown.lock().expect("lock poisoned") = Arc::new(Notify::new());
        core.cancelled.store(false, Ordering::Release);
        core.emitted.lock().expect("lock poisoned").clear();
        core.deferments.clear();
        core.results.clear_buffered().await;

        let (tx, rx) = mpsc::channel(core.stream_capacity);
        *core.consumer.lock().expect("lock poisoned") = Some(tx);

        let started = async {
            core.persistent.warm_up().await?;
            self.resolve_root(root_id).await
        };
        let root = match started.await {
            Ok(root) => root,
            Err(error) => {
                core.set_state(LoadState::Failed);
                core.consumer.lock().expect("lock poisoned").take();
                return Err(error);
            }
        };

        let total = root.base.as_ref().and_then(|b| b.closure()).map(|c| c.len());
        info!(root = %root_id.short(), ?total, "starting closure load");
        core.downloader.initialize_pool(total);
        core.set_state(LoadState::StreamingClosure);

        let driver = tokio::spawn(run_driver(Arc::clone(core), root));
        *self.driver.lock().expect("lock poisoned") = Some(driver);

        Ok(ReceiverStream::new(rx))
    }

    /// Single lookup: memory, persistent tier, then the single-object
    /// endpoint. Returns `None` only for documents that exist but carry
    /// nothing loadable.
    pub async fn get_item(&self, id: &BaseId) -> LoaderResult<Option<Item>> {
        let core = &self.core;
        core.check_live()?;

        // Cached, or registered with an active load: share that
        // resolution rather than fetching again.
        if let Some(deferred) = core.deferments.defer_known(id)? {
            return Ok(Some(deferred.resolve().await?));
        }
        // Unknown id: resolve it directly, without holding a registration.
        // A load that discovers this id concurrently still owns its own
        // fetch and emission; single lookups never stand in for closure
        // traffic.
        let fetched = match core.persistent.get_one(id).await? {
            Some(item) => Some(item),
            None => core.downloader.download_single(id).await?,
        };
        match fetched {
            Some(item) => {
                if let Err(error) = core.writer.add(item.clone()) {
                    if !matches!(error, CacheError::Disposed) {
                        warn!(%error, "write-behind rejected item");
                    }
                }
                core.memory.add(&item, &mut |_| {})?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Expected closure size (root's closure table plus the root itself),
    /// or 1 when the root carries no table; 0 for an unavailable root.
    pub async fn get_total_count(&self, root_id: &BaseId) -> LoaderResult<usize> {
        match self.get_item(root_id).await? {
            Some(item) => Ok(item
                .base
                .as_ref()
                .and_then(|b| b.closure())
                .map(|closure| closure.len() + 1)
                .unwrap_or(1)),
            None => Ok(0),
        }
    }

    /// Cooperative cancellation: no further fetches are issued, in-flight
    /// results are discarded, already-committed cache writes stay (they
    /// are valid regardless — content addressing).
    pub fn cancel(&self) {
        let core = &self.core;
        core.cancelled.store(true, Ordering::Release);
        core.downloader.cancel();
        {
            let mut state = core.state.lock().expect("lock poisoned");
            if matches!(
                *state,
                LoadState::ResolvingRoot | LoadState::StreamingClosure | LoadState::Draining
            ) {
                *state = LoadState::Cancelled;
            }
        }
        core.deferments.clear();
        core.consumer.lock().expect("lock poisoned").take();
        core.shutdown_handle().notify_one();
    }

    /// Drain the write-behind queue, tear down the pipeline, and close the
    /// persistent store. Surfaces the writer's failure if one occurred.
    pub async fn dispose(&self) -> LoaderResult<()> {
        let core = &self.core;
        if core.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        core.cancelled.store(true, Ordering::Release);
        core.downloader.cancel();
        core.shutdown_handle().notify_one();
        core.consumer.lock().expect("lock poisoned").take();

        let driver = self.driver.lock().expect("lock poisoned").take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }

        core.downloader.dispose_async().await.ok();
        let writer_result = core.writer.dispose_async().await;
        core.persistent.dispose_async().await.ok();
        core.deferments.dispose();
        core.memory.dispose();
        core.store.dispose().await.ok();

        writer_result.map_err(LoaderError::from)
    }

    async fn resolve_root(&self, id: &BaseId) -> LoaderResult<Item> {
        let core = &self.core;
        if let Some(item) = core.memory.get(id)? {
            return Ok(item);
        }
        if let Some(item) = core.persistent.get_one(id).await? {
            return Ok(item);
        }
        match core.downloader.download_single(id).await? {
            Some(item) => Ok(item),
            None => Err(LoaderError::RootUnavailable(id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use futures_util::stream;
    use serde_json::json;
    use tokio_stream::StreamExt;

    use filament_cache::{CacheOptions, CacheWriterOptions, PersistentCacheOptions};
    use filament_store::InMemoryDatabase;
    use filament_transport::{ByteStream, DownloaderOptions, TransportResult};

    /// Serves canned documents as wire frames and records every request.
    struct FakeTransport {
        docs: HashMap<String, String>,
        batch_requests: Mutex<Vec<Vec<String>>>,
        single_requests: Mutex<Vec<String>>,
        batch_status: Option<u16>,
    }

    impl FakeTransport {
        fn new(docs: &[(&str, String)]) -> Arc<Self> {
            Arc::new(Self {
                docs: docs
                    .iter()
                    .map(|(id, doc)| (id.to_string(), doc.clone()))
                    .collect(),
                batch_requests: Mutex::new(Vec::new()),
                single_requests: Mutex::new(Vec::new()),
                batch_status: None,
            })
        }

        fn with_failing_batches(docs: &[(&str, String)], status: u16) -> Arc<Self> {
            Arc::new(Self {
                docs: docs
                    .iter()
                    .map(|(id, doc)| (id.to_string(), doc.clone()))
                    .collect(),
                batch_requests: Mutex::new(Vec::new()),
                single_requests: Mutex::new(Vec::new()),
                batch_status: Some(status),
            })
        }

        fn batched_ids(&self) -> Vec<Vec<String>> {
            self.batch_requests.lock().unwrap().clone()
        }

        fn single_ids(&self) -> Vec<String> {
            self.single_requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ObjectTransport for FakeTransport {
        async fn fetch_batch(&self, ids: &[BaseId]) -> TransportResult<ByteStream> {
            self.batch_requests
                .lock()
                .unwrap()
                .push(ids.iter().map(|id| id.as_str().to_owned()).collect());
            if let Some(status) = self.batch_status {
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
                .chunks(16)
                .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }

        async fn fetch_single(&self, id: &BaseId) -> TransportResult<String> {
            self.single_requests
                .lock()
                .unwrap()
                .push(id.as_str().to_owned());
            self.docs
                .get(id.as_str())
                .cloned()
                .ok_or(TransportError::Failed { status: 404 })
        }
    }

    fn doc(id: &str, refs: &[&str]) -> String {
        let children: Vec<_> = refs
            .iter()
            .map(|r| json!({ "speckle_type": "reference", "referencedId": r }))
            .collect();
        json!({ "id": id, "speckle_type": "Base", "data": children }).to_string()
    }

    fn doc_with_closure(id: &str, refs: &[&str], closure: &[(&str, i64)]) -> String {
        let children: Vec<_> = refs
            .iter()
            .map(|r| json!({ "speckle_type": "reference", "referencedId": r }))
            .collect();
        let table: serde_json::Map<String, serde_json::Value> = closure
            .iter()
            .map(|(cid, depth)| (cid.to_string(), json!(depth)))
            .collect();
        json!({
            "id": id,
            "speckle_type": "Base",
            "data": children,
            "__closure__": table
        })
        .to_string()
    }

    fn test_options() -> LoaderOptions {
        LoaderOptions {
            downloader: DownloaderOptions {
                max_batch_wait: Duration::from_millis(10),
            },
            persistent: PersistentCacheOptions {
                max_read_size: 100,
                max_read_wait: Duration::from_millis(5),
                index: CacheOptions::default(),
            },
            writer: CacheWriterOptions {
                max_write_size: 100,
                max_write_wait: Duration::from_millis(10),
            },
            ..LoaderOptions::default()
        }
    }

    fn make_loader(transport: Arc<FakeTransport>) -> (GraphLoader, Arc<InMemoryDatabase>) {
        let store = Arc::new(InMemoryDatabase::new());
        let loader = GraphLoader::new(
            transport,
            Arc::clone(&store) as Arc<dyn ObjectDatabase>,
            test_options(),
        );
        (loader, store)
    }

    async fn collect(
        stream: ReceiverStream<LoaderResult<Item>>,
    ) -> (Vec<String>, Vec<LoaderError>) {
        let gathered = tokio::time::timeout(Duration::from_secs(5), async {
            let mut items = Vec::new();
            let mut errors = Vec::new();
            let mut stream = stream;
            while let Some(result) = stream.next().await {
                match result {
                    Ok(item) => items.push(item.base_id.as_str().to_owned()),
                    Err(error) => errors.push(error),
                }
            }
            (items, errors)
        })
        .await;
        gathered.expect("load did not terminate")
    }

    // -----------------------------------------------------------------------
    // Closure resolution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn diamond_closure_fetches_shared_child_once() {
        // root -> {c1, c2}, c1 -> {c2}: c2 must go over the wire once.
        let transport = FakeTransport::new(&[
            ("root", doc("root", &["c1", "c2"])),
            ("c1", doc("c1", &["c2"])),
            ("c2", doc("c2", &[])),
        ]);
        let (loader, _store) = make_loader(Arc::clone(&transport));

        let stream = loader.load(&BaseId::from("root")).await.unwrap();
        let (mut items, errors) = collect(stream).await;

        assert!(errors.is_empty());
        items.sort();
        assert_eq!(items, vec!["c1", "c2", "root"]);
        assert_eq!(loader.state(), LoadState::Settled);

        let requested: Vec<String> = transport.batched_ids().into_iter().flatten().collect();
        let unique: HashSet<&String> = requested.iter().collect();
        assert_eq!(requested.len(), unique.len(), "an id was fetched twice");
    }

    #[tokio::test]
    async fn closure_table_drives_a_single_batch() {
        let transport = FakeTransport::new(&[
            (
                "root",
                doc_with_closure("root", &["c1"], &[("c1", 1), ("c2", 2)]),
            ),
            ("c1", doc("c1", &["c2"])),
            ("c2", doc("c2", &[])),
        ]);
        let (loader, _store) = make_loader(Arc::clone(&transport));

        let stream = loader.load(&BaseId::from("root")).await.unwrap();
        let (mut items, errors) = collect(stream).await;

        assert!(errors.is_empty());
        items.sort();
        assert_eq!(items, vec!["c1", "c2", "root"]);
        // Expected total 2 <= 50: the policy allows a single batch holding
        // both children.
        assert_eq!(transport.batched_ids().len(), 1);
    }

    #[tokio::test]
    async fn second_load_is_served_from_cache() {
        let transport = FakeTransport::new(&[
            ("root", doc("root", &["c1"])),
            ("c1", doc("c1", &[])),
        ]);
        let (loader, _store) = make_loader(Arc::clone(&transport));

        let stream = loader.load(&BaseId::from("root")).await.unwrap();
        collect(stream).await;
        let batches_after_first = transport.batched_ids().len();
        let singles_after_first = transport.single_ids().len();

        let stream = loader.load(&BaseId::from("root")).await.unwrap();
        let (mut items, errors) = collect(stream).await;

        assert!(errors.is_empty());
        items.sort();
        assert_eq!(items, vec!["c1", "root"]);
        assert_eq!(transport.batched_ids().len(), batches_after_first);
        assert_eq!(transport.single_ids().len(), singles_after_first);
    }

    #[tokio::test]
    async fn leaf_root_settles_immediately() {
        let transport = FakeTransport::new(&[("solo", doc("solo", &[]))]);
        let (loader, _store) = make_loader(transport);

        let stream = loader.load(&BaseId::from("solo")).await.unwrap();
        let (items, errors) = collect(stream).await;

        assert_eq!(items, vec!["solo"]);
        assert!(errors.is_empty());
        assert_eq!(loader.state(), LoadState::Settled);
    }

    // -----------------------------------------------------------------------
    // Failure modes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn per_item_failure_does_not_abort_the_load() {
        let transport = FakeTransport::new(&[
            ("root", doc("root", &["bad", "ok"])),
            ("bad", "{definitely not json".to_owned()),
            ("ok", doc("ok", &[])),
        ]);
        let (loader, _store) = make_loader(transport);

        let stream = loader.load(&BaseId::from("root")).await.unwrap();
        let (mut items, errors) = collect(stream).await;

        items.sort();
        assert_eq!(items, vec!["ok", "root"]);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            LoaderError::Transport(TransportError::Wire(WireError::InvalidItem { .. }))
        ));
        assert_eq!(loader.state(), LoadState::Settled);
    }

    #[tokio::test]
    async fn access_denied_fails_the_whole_load() {
        let transport = FakeTransport::with_failing_batches(
            &[("root", doc("root", &["c1"]))],
            403,
        );
        let (loader, _store) = make_loader(transport);

        let stream = loader.load(&BaseId::from("root")).await.unwrap();
        let (items, errors) = collect(stream).await;

        assert_eq!(items, vec!["root"]);
        assert!(matches!(
            errors[0],
            LoaderError::Transport(TransportError::AccessDenied { status: 403 })
        ));
        assert_eq!(loader.state(), LoadState::Failed);
    }

    #[tokio::test]
    async fn missing_response_ids_fail_with_integrity_error() {
        let transport = FakeTransport::new(&[("root", doc("root", &["ghost"]))]);
        let (loader, _store) = make_loader(transport);

        let stream = loader.load(&BaseId::from("root")).await.unwrap();
        let (_, errors) = collect(stream).await;

        assert!(errors.iter().any(|e| matches!(
            e,
            LoaderError::Transport(TransportError::Integrity { .. })
        )));
        assert_eq!(loader.state(), LoadState::Failed);
    }

    #[tokio::test]
    async fn unavailable_root_fails_the_load_call() {
        let raw = r#"{"id":"root","speckle_type":"Objects.Other.RawEncoding"}"#.to_owned();
        let transport = FakeTransport::new(&[("root", raw)]);
        let (loader, _store) = make_loader(transport);

        let error = loader.load(&BaseId::from("root")).await.unwrap_err();
        assert!(matches!(error, LoaderError::RootUnavailable(_)));
        assert_eq!(loader.state(), LoadState::Failed);
    }

    // -----------------------------------------------------------------------
    // Single lookups
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn get_item_falls_back_to_the_network_then_caches() {
        let transport = FakeTransport::new(&[("solo", doc("solo", &[]))]);
        let (loader, _store) = make_loader(Arc::clone(&transport));

        let item = loader.get_item(&BaseId::from("solo")).await.unwrap().unwrap();
        assert_eq!(item.base_id.as_str(), "solo");
        assert_eq!(transport.single_ids(), vec!["solo"]);

        // Served from the memory cache now.
        loader.get_item(&BaseId::from("solo")).await.unwrap().unwrap();
        assert_eq!(transport.single_ids().len(), 1);
    }

    #[tokio::test]
    async fn get_item_prefers_the_persistent_tier() {
        let transport = FakeTransport::new(&[]);
        let (loader, store) = make_loader(Arc::clone(&transport));
        let base =
            filament_types::Base::from_json(json!({ "id": "stored", "speckle_type": "Base" }))
                .unwrap();
        store
            .put_all(&[Item::resolved(base, Some(4))])
            .await
            .unwrap();

        let item = loader.get_item(&BaseId::from("stored")).await.unwrap();
        assert!(item.is_some());
        assert!(transport.single_ids().is_empty());
    }

    #[tokio::test]
    async fn get_total_count_uses_the_closure_table() {
        let transport = FakeTransport::new(&[(
            "root",
            doc_with_closure("root", &[], &[("a", 1), ("b", 1)]),
        )]);
        let (loader, _store) = make_loader(transport);

        assert_eq!(loader.get_total_count(&BaseId::from("root")).await.unwrap(), 3);
    }

    // -----------------------------------------------------------------------
    // Cancellation and disposal
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cancel_terminates_the_stream() {
        let transport = FakeTransport::new(&[
            ("root", doc("root", &["c1"])),
            ("c1", doc("c1", &[])),
        ]);
        let (loader, _store) = make_loader(transport);

        let stream = loader.load(&BaseId::from("root")).await.unwrap();
        loader.cancel();
        assert_eq!(loader.state(), LoadState::Cancelled);

        // The stream ends rather than hanging on never-arriving items.
        collect(stream).await;
    }

    #[tokio::test]
    async fn dispose_drains_writes_and_rejects_further_use() {
        let transport = FakeTransport::new(&[
            ("root", doc("root", &["c1"])),
            ("c1", doc("c1", &[])),
        ]);
        let (loader, store) = make_loader(transport);

        let stream = loader.load(&BaseId::from("root")).await.unwrap();
        collect(stream).await;

        // Both wire-resolved items reach the store once the write-behind
        // queue flushes.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while store.len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "writes never landed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        loader.dispose().await.unwrap();
        assert!(matches!(
            loader.get_item(&BaseId::from("root")).await,
            Err(LoaderError::Disposed)
        ));
        assert!(matches!(
            loader.load(&BaseId::from("root")).await,
            Err(LoaderError::Disposed)
        ));
    }
}
