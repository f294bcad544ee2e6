use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::formats::{CacheState, OfflineManifest, OfflineStatus};
use crate::worker::cache_store::CacheStorage;
use crate::worker::client::{ControllerHandle, OfflineClient};
use crate::worker::fetcher::Fetcher;
use crate::worker::model::{ClearCacheAck, Envelope, FetchRequest, RequestKind, Response};
use crate::worker::state::{Task, WorkerEvent, WorkerState, transition};
use crate::worker::status_store::StatusStore;

pub const DEFAULT_CACHE_VERSION: &str = "dexie-offline-v1";
pub const DEFAULT_MANIFEST_PATH: &str = "/offline-manifest.json";
pub const DEFAULT_SEARCH_INDEX_PREFIX: &str = "/search-index";

#[derive(Debug, Clone)]
pub struct ServiceWorkerConfig {
    /// Names the only cache partition that survives activation.
    pub version: String,
    pub manifest_path: String,
    pub search_index_prefix: String,
    /// Races network requests against this limit before falling back.
    pub fetch_timeout: Option<Duration>,
    pub prefetch_concurrency: usize,
}

impl ServiceWorkerConfig {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            manifest_path: DEFAULT_MANIFEST_PATH.to_owned(),
            search_index_prefix: DEFAULT_SEARCH_INDEX_PREFIX.to_owned(),
            fetch_timeout: None,
            prefetch_concurrency: 4,
        }
    }
}

impl Default for ServiceWorkerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_VERSION)
    }
}

#[derive(Clone)]
pub struct ServiceWorker {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceWorkerConfig,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<dyn CacheStorage>,
    status: Arc<StatusStore>,
    state: Mutex<WorkerState>,
    skip_waiting: AtomicBool,
    clients_claimed: AtomicBool,
    prefetching: watch::Sender<bool>,
    /// Cancels the prefetch run in flight, if any.
    prefetch_cancel: StdMutex<Option<CancellationToken>>,
}

#[derive(Debug)]
struct PrefetchJob {
    path: String,
    /// Route and hash recorded once a search-index file is stored.
    doc: Option<(String, String)>,
}

impl ServiceWorker {
    pub fn new(
        config: ServiceWorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<dyn CacheStorage>,
        status: Arc<StatusStore>,
    ) -> Self {
        let (prefetching, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                caches,
                status,
                state: Mutex::new(WorkerState::Idle),
                skip_waiting: AtomicBool::new(false),
                clients_claimed: AtomicBool::new(false),
                prefetching,
                prefetch_cancel: StdMutex::new(None),
            }),
        }
    }

    pub fn version(&self) -> &str {
        &self.inner.config.version
    }

    pub async fn state(&self) -> WorkerState {
        *self.inner.state.lock().await
    }

    /// Whether open clients are governed by this instance.
    pub fn is_controlling(&self) -> bool {
        self.inner.clients_claimed.load(Ordering::SeqCst)
    }

    pub fn status_store(&self) -> &Arc<StatusStore> {
        &self.inner.status
    }

    /// Applies one event to the lifecycle and returns the work it asks for.
    pub async fn dispatch(&self, event: &WorkerEvent) -> Vec<Task> {
        let mut state = self.inner.state.lock().await;
        let step = transition(*state, event);
        if step.next != *state {
            tracing::debug!(from = ?*state, to = ?step.next, "worker state changed");
        }
        *state = step.next;
        step.tasks
    }

    pub async fn install(&self) -> anyhow::Result<()> {
        let tasks = self.dispatch(&WorkerEvent::Install).await;
        self.run_tasks(tasks).await.context("install")?;
        let tasks = self.dispatch(&WorkerEvent::InstallComplete).await;
        self.run_tasks(tasks).await.context("finish install")?;
        Ok(())
    }

    pub async fn activate(&self) -> anyhow::Result<()> {
        let tasks = self.dispatch(&WorkerEvent::Activate).await;
        self.run_tasks(tasks).await.context("activate")?;
        tracing::info!(version = %self.version(), "service worker active");
        Ok(())
    }

    /// Installs and, since installation skips waiting, activates right away.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.install().await?;
        if self.inner.skip_waiting.load(Ordering::SeqCst) {
            self.activate().await?;
        }
        Ok(())
    }

    /// Answers a request: network first, then cache, then a fallback.
    pub async fn handle_fetch(&self, request: FetchRequest) -> Response {
        let tasks = self.dispatch(&WorkerEvent::Fetch(request.clone())).await;
        match self.run_tasks(tasks).await {
            Ok(Some(response)) => response,
            Ok(None) => offline_fallback(&request),
            Err(err) => {
                tracing::warn!(path = %request.path, err = format!("{err:#}"), "fetch handling failed");
                offline_fallback(&request)
            }
        }
    }

    pub async fn handle_message(&self, envelope: Envelope) {
        let Envelope { message, reply } = envelope;
        tracing::debug!(?message, "control message");

        let tasks = self.dispatch(&WorkerEvent::Message(message)).await;
        let result = self.run_tasks(tasks).await;
        if let Err(err) = &result {
            tracing::warn!(?message, err = format!("{err:#}"), "control message failed");
        }

        if let Some(reply) = reply {
            let ack = ClearCacheAck {
                success: result.is_ok(),
            };
            if reply.send(ack).is_err() {
                tracing::debug!(?message, "sender stopped listening for the acknowledgment");
            }
        }
    }

    /// Starts the message loop; messages are handled one at a time.
    pub fn listen(&self, capacity: usize) -> ControllerHandle {
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));
        let worker = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                worker.handle_message(envelope).await;
            }
            tracing::debug!("control channel closed");
        });
        ControllerHandle::new(tx)
    }

    /// A page-side client; it only gets the controller once clients are claimed.
    pub fn client(&self, controller: Option<ControllerHandle>) -> OfflineClient {
        let controller = controller.filter(|_| self.is_controlling());
        OfflineClient::new(controller, self.inner.status.subscribe())
    }

    pub async fn wait_for_prefetch(&self) {
        let mut rx = self.inner.prefetching.subscribe();
        if rx.wait_for(|running| !*running).await.is_err() {
            tracing::debug!("prefetch tracker dropped");
        }
    }

    /// Runs tasks in order. Claiming clients is a flag flip, so it never
    /// holds back the partition cleanup that follows it.
    async fn run_tasks(&self, tasks: Vec<Task>) -> anyhow::Result<Option<Response>> {
        let mut response = None;
        for task in tasks {
            if let Some(out) = self.run_task(task).await? {
                response = Some(out);
            }
        }
        Ok(response)
    }

    async fn run_task(&self, task: Task) -> anyhow::Result<Option<Response>> {
        match task {
            Task::SkipWaiting => {
                self.inner.skip_waiting.store(true, Ordering::SeqCst);
            }
            Task::ClaimClients => self.inner.clients_claimed.store(true, Ordering::SeqCst),
            Task::DeleteStalePartitions => self
                .delete_stale_partitions()
                .await
                .context("delete stale cache partitions")?,
            Task::EnsureStatus => self.ensure_status().await?,
            Task::Prefetch => self.spawn_prefetch(),
            Task::NetworkFirst(request) => return Ok(Some(self.network_first(&request).await)),
            Task::NetworkOnly(request) => return Ok(Some(self.network_only(&request).await)),
            Task::ClearAllCaches => self.clear_all_caches().await?,
            Task::ResetStatus => self.inner.status.reset().await.context("reset status")?,
        }
        Ok(None)
    }

    async fn delete_stale_partitions(&self) -> anyhow::Result<()> {
        let version = self.version();
        for partition in self.inner.caches.keys().await.context("list partitions")? {
            if partition == version {
                continue;
            }
            self.inner
                .caches
                .delete(&partition)
                .await
                .with_context(|| format!("delete partition {partition}"))?;
            tracing::info!(%partition, "deleted stale cache partition");
        }
        Ok(())
    }

    async fn clear_all_caches(&self) -> anyhow::Result<()> {
        self.cancel_prefetch().await;
        for partition in self.inner.caches.keys().await.context("list partitions")? {
            self.inner
                .caches
                .delete(&partition)
                .await
                .with_context(|| format!("delete partition {partition}"))?;
        }
        tracing::info!("offline caches cleared");
        Ok(())
    }

    async fn ensure_status(&self) -> anyhow::Result<()> {
        let current = self.inner.status.current();
        if current.is_some_and(|s| s.version == self.version()) {
            return Ok(());
        }
        self.inner
            .status
            .put(OfflineStatus::not_started(self.version()))
            .await
            .context("create offline status")
    }

    async fn fetch_network(&self, path: &str) -> anyhow::Result<Response> {
        let fetch = self.inner.fetcher.fetch(path);
        match self.inner.config.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch)
                .await
                .map_err(|_| anyhow::anyhow!("network timed out after {limit:?}"))?,
            None => fetch.await,
        }
    }

    async fn network_first(&self, request: &FetchRequest) -> Response {
        match self.fetch_network(&request.path).await {
            Ok(response) => {
                if response.is_success() {
                    self.refresh_cached(request, &response).await;
                }
                response
            }
            Err(err) => {
                tracing::debug!(path = %request.path, err = format!("{err:#}"), "network failed; trying cache");
                match self.cached(request.cache_key()).await {
                    Some(response) => response,
                    None => offline_fallback(request),
                }
            }
        }
    }

    async fn network_only(&self, request: &FetchRequest) -> Response {
        match self.fetch_network(&request.path).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(path = %request.path, err = format!("{err:#}"), "network failed");
                offline_fallback(request)
            }
        }
    }

    async fn cached(&self, key: &str) -> Option<Response> {
        let lookup = async {
            if let Some(response) = self.inner.caches.get(self.version(), key).await? {
                return Ok(Some(response));
            }
            self.inner.caches.match_any(key).await
        };
        match lookup.await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(%key, err = format!("{err:#}"), "cache lookup failed");
                None
            }
        }
    }

    /// Keeps an already-cached entry in step with what the network returned.
    async fn refresh_cached(&self, request: &FetchRequest, response: &Response) {
        let caches = &self.inner.caches;
        let key = request.cache_key();
        let refreshed = async {
            if caches.get(self.version(), key).await?.is_some() {
                caches.put(self.version(), key, response).await?;
            }
            anyhow::Ok(())
        };
        if let Err(err) = refreshed.await {
            tracing::debug!(%key, err = format!("{err:#}"), "cache refresh failed");
        }
    }

    fn spawn_prefetch(&self) {
        let cancel = CancellationToken::new();
        *self
            .inner
            .prefetch_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
        self.inner.prefetching.send_replace(true);

        let worker = self.clone();
        tokio::spawn(async move {
            match worker.prefetch(&cancel).await {
                Ok(()) => {}
                Err(_) if cancel.is_cancelled() => tracing::info!("cache warming cancelled"),
                Err(err) => {
                    tracing::warn!(err = format!("{err:#}"), "cache warming failed");
                    if let Err(err) = worker.mark_failed(format!("{err:#}")).await {
                        tracing::warn!(err = format!("{err:#}"), "could not record failed status");
                    }
                }
            }
            worker.dispatch(&WorkerEvent::PrefetchFinished).await;
            worker.inner.prefetching.send_replace(false);
        });
    }

    /// Stops the prefetch run in flight and waits until it wrote its last entry.
    async fn cancel_prefetch(&self) {
        let cancel = self
            .inner
            .prefetch_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.wait_for_prefetch().await;
    }

    async fn load_manifest(&self, cancel: &CancellationToken) -> anyhow::Result<OfflineManifest> {
        let path = &self.inner.config.manifest_path;
        let response = tokio::select! {
            () = cancel.cancelled() => anyhow::bail!("cancelled before the manifest arrived"),
            fetched = self.fetch_network(path) => fetched.with_context(|| format!("fetch {path}"))?,
        };
        if !response.is_success() {
            anyhow::bail!("{path} returned status {}", response.status);
        }
        serde_json::from_slice(&response.body).context("parse offline manifest")
    }

    async fn prefetch(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let manifest = self.load_manifest(cancel).await?;
        let status = &self.inner.status;

        let previous_hashes = status
            .current()
            .filter(|s| s.version == self.version())
            .map(|s| s.doc_hashes)
            .unwrap_or_default();

        let mut jobs = manifest
            .cacheable_paths()
            .map(|path| PrefetchJob {
                path: path.to_owned(),
                doc: None,
            })
            .collect::<Vec<_>>();

        let mut kept_hashes = BTreeMap::new();
        for meta in manifest.full_text_metas.iter().flatten() {
            let path = search_index_url(&self.inner.config.search_index_prefix, &meta.route);
            let unchanged = previous_hashes.get(&meta.route) == Some(&meta.content_hash);
            if unchanged && self.cached_in_current(&path).await {
                kept_hashes.insert(meta.route.clone(), meta.content_hash.clone());
                continue;
            }
            jobs.push(PrefetchJob {
                path,
                doc: Some((meta.route.clone(), meta.content_hash.clone())),
            });
        }

        if cancel.is_cancelled() {
            anyhow::bail!("cancelled before caching started");
        }
        let mut started = OfflineStatus::not_started(self.version());
        started.state = CacheState::InProgress;
        started.total = jobs.len() + kept_hashes.len();
        started.cached = kept_hashes.len();
        started.doc_hashes = kept_hashes;
        status.put(started).await.context("record prefetch start")?;
        tracing::info!(resources = jobs.len(), "cache warming started");

        let semaphore = Arc::new(Semaphore::new(self.inner.config.prefetch_concurrency.max(1)));
        let mut set = JoinSet::new();
        for job in jobs {
            let worker = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (job, Err(anyhow::anyhow!("prefetch queue closed")));
                };
                let outcome = worker.cache_one(&job.path, &cancel).await;
                (job, outcome)
            });
        }

        // In-flight jobs always run to completion so nothing is written after
        // this function returns; once cancelled they are only drained.
        while let Some(joined) = set.join_next().await {
            if cancel.is_cancelled() {
                continue;
            }
            let (job, outcome) = match joined {
                Ok(done) => done,
                Err(err) => {
                    tracing::warn!(?err, "prefetch task aborted");
                    status.update(|s| s.failed += 1).await?;
                    continue;
                }
            };
            match outcome {
                Ok(()) => {
                    status
                        .update(|s| {
                            s.cached += 1;
                            if let Some((route, hash)) = job.doc {
                                s.doc_hashes.insert(route, hash);
                            }
                        })
                        .await?;
                }
                Err(err) => {
                    tracing::debug!(path = %job.path, err = format!("{err:#}"), "prefetch skipped resource");
                    status.update(|s| s.failed += 1).await?;
                }
            }
        }

        if cancel.is_cancelled() {
            anyhow::bail!("cancelled while caching");
        }
        let finished = status
            .update(|s| {
                let failed = s.failed;
                s.state = CacheState::Complete;
                s.message = (failed > 0).then(|| format!("{failed} resources could not be cached"));
            })
            .await?;
        if let Some(finished) = finished {
            tracing::info!(
                cached = finished.cached,
                failed = finished.failed,
                "cache warming complete"
            );
        }
        Ok(())
    }

    async fn cached_in_current(&self, key: &str) -> bool {
        matches!(self.inner.caches.get(self.version(), key).await, Ok(Some(_)))
    }

    async fn cache_one(&self, path: &str, cancel: &CancellationToken) -> anyhow::Result<()> {
        let response = tokio::select! {
            () = cancel.cancelled() => anyhow::bail!("cancelled"),
            fetched = self.fetch_network(path) => fetched?,
        };
        if !response.is_success() {
            anyhow::bail!("{path} returned status {}", response.status);
        }
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled");
        }
        self.inner
            .caches
            .put(self.version(), path, &response)
            .await
            .with_context(|| format!("cache {path}"))
    }

    async fn mark_failed(&self, message: String) -> anyhow::Result<()> {
        let status = &self.inner.status;
        let mut failed = status
            .current()
            .unwrap_or_else(|| OfflineStatus::not_started(self.version()));
        failed.state = CacheState::Failed;
        failed.message = Some(message);
        failed.updated_at = chrono::Utc::now();
        status.put(failed).await
    }
}

fn offline_fallback(request: &FetchRequest) -> Response {
    match request.kind {
        RequestKind::Document => Response::offline_page(),
        RequestKind::Resource => Response::network_error(),
    }
}

/// Where the per-document index file of `route` is served.
pub fn search_index_url(prefix: &str, route: &str) -> String {
    format!("{}{route}.json", prefix.trim_end_matches('/'))
}
