//! # Download Scheduler
//!
//! Owns the registry of in-flight download requests and a bounded pool of
//! connection tasks. At most one request exists per URL; later callers for
//! the same URL join its waiter list instead of starting another fetch.
//!
//! Work arrives on two lanes. The on-demand lane is always drained before the
//! background lane, and the background lane can be paused without losing its
//! queue. The pool limit is re-read from the speed monitor's classification
//! every time a task is about to start.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{AssetKey, CacheState, TieredCacheStore};
use crate::config::{SchedulerConfig, StashConfig};
use crate::connection::{AssetFetcher, ConnectionTask, NetworkActivity, TaskOutcome};
use crate::monitor::{NetworkClassification, NetworkSpeedMonitor};

/// Completion callback receiving the URL and its bytes, or `None` when the
/// download failed or was cancelled.
pub type Completion = Box<dyn FnOnce(&AssetKey, Option<Bytes>) + Send + 'static>;

/// Someone waiting on a download
pub enum Waiter {
    Callback(Completion),
    Channel(oneshot::Sender<Option<Bytes>>),
}

impl Waiter {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(&AssetKey, Option<Bytes>) + Send + 'static,
    {
        Waiter::Callback(Box::new(f))
    }

    pub fn channel() -> (Self, oneshot::Receiver<Option<Bytes>>) {
        let (tx, rx) = oneshot::channel();
        (Waiter::Channel(tx), rx)
    }

    fn notify(self, key: &AssetKey, data: Option<Bytes>) {
        match self {
            Waiter::Callback(f) => f(key, data),
            Waiter::Channel(tx) => {
                let _ = tx.send(data);
            }
        }
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Waiter::Callback(_) => f.write_str("Waiter::Callback"),
            Waiter::Channel(_) => f.write_str("Waiter::Channel"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    OnDemand,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    InFlight,
    Completed,
    Failed,
}

/// Broadcast to subscribers independently of the waiter callbacks
#[derive(Debug, Clone)]
pub enum AssetEvent {
    DownloadComplete { url: AssetKey, data: Option<Bytes> },
}

/// Read-only aggregate for dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheCounters {
    pub remaining_queued_items: usize,
    pub total_requested_items: u64,
    pub current_cache_state: CacheState,
    /// Bytes per second of the most recent completed download
    pub last_sampled_speed: f64,
    pub current_network_state: NetworkClassification,
}

#[derive(Debug)]
struct DownloadRequest {
    id: u64,
    waiters: Vec<Waiter>,
    state: RequestState,
    lane: Lane,
    enqueued_at: Instant,
    cancel: CancellationToken,
    /// Caller-built request, handed to the connection task when it starts
    prebuilt: Option<reqwest::Request>,
}

#[derive(Debug, Default)]
struct Registry {
    requests: HashMap<AssetKey, DownloadRequest>,
    next_id: u64,
    stopped: bool,
}

#[derive(Debug)]
struct Job {
    key: AssetKey,
    id: u64,
}

struct Shared {
    store: Arc<TieredCacheStore>,
    fetcher: Arc<dyn AssetFetcher>,
    monitor: Arc<NetworkSpeedMonitor>,
    config: SchedulerConfig,
    activity: NetworkActivity,
    registry: Mutex<Registry>,
    total_requested: AtomicU64,
    events: broadcast::Sender<AssetEvent>,
    background_enabled: watch::Sender<bool>,
    shutdown: CancellationToken,
}

/// Single-flight download scheduler
pub struct DownloadScheduler {
    shared: Arc<Shared>,
    on_demand_tx: mpsc::UnboundedSender<Job>,
    background_tx: mpsc::UnboundedSender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadScheduler {
    /// Create the scheduler and spawn its run loop on the current runtime.
    pub fn start(
        store: Arc<TieredCacheStore>,
        fetcher: Arc<dyn AssetFetcher>,
        monitor: Arc<NetworkSpeedMonitor>,
        activity: NetworkActivity,
        config: &StashConfig,
    ) -> Self {
        let (on_demand_tx, on_demand_rx) = mpsc::unbounded_channel();
        let (background_tx, background_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (background_enabled, _) = watch::channel(config.background_caching);

        let shared = Arc::new(Shared {
            store,
            fetcher,
            monitor,
            config: config.scheduler.clone(),
            activity,
            registry: Mutex::new(Registry::default()),
            total_requested: AtomicU64::new(0),
            events,
            background_enabled,
            shutdown: CancellationToken::new(),
        });

        let worker = tokio::spawn(Shared::run(
            Arc::clone(&shared),
            on_demand_rx,
            background_rx,
        ));

        Self {
            shared,
            on_demand_tx,
            background_tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register `waiter` for `key` on `lane`.
    ///
    /// A memory-tier hit notifies the waiter before returning. If a request
    /// for `key` already exists the waiter joins it and no new fetch starts.
    pub fn enqueue(&self, key: AssetKey, lane: Lane, waiter: Waiter) {
        self.enqueue_with(key, None, lane, waiter);
    }

    /// Like [`enqueue`](Self::enqueue), but a new download sends `request`
    /// instead of a plain GET. The asset is keyed by the request URL. When a
    /// download for that URL already exists the waiter joins it and
    /// `request` is dropped.
    pub fn enqueue_request(&self, request: reqwest::Request, lane: Lane, waiter: Waiter) {
        let key = AssetKey::from(request.url());
        self.enqueue_with(key, Some(request), lane, waiter);
    }

    fn enqueue_with(
        &self,
        key: AssetKey,
        prebuilt: Option<reqwest::Request>,
        lane: Lane,
        waiter: Waiter,
    ) {
        if let Some(data) = self.shared.store.peek(&key) {
            waiter.notify(&key, Some(data));
            return;
        }
        if let Err(Some(waiter)) = self.register(key.clone(), lane, Some(waiter), prebuilt) {
            let data = self.shared.store.peek(&key);
            waiter.notify(&key, data);
        }
    }

    /// Queue every key not already cached in memory or in flight on the
    /// background lane. Returns how many new requests were created.
    pub fn enqueue_batch<I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = AssetKey>,
    {
        let mut created = 0;
        for key in keys {
            if self.shared.store.peek(&key).is_some() {
                continue;
            }
            if let Ok(true) = self.register(key, Lane::Background, None, None) {
                created += 1;
            }
        }
        created
    }

    // Atomic check-then-act against the registry. Ok(true) when a new
    // request was created, Ok(false) when joined. Err hands the waiter back
    // when the key turned out to be resident or the scheduler is stopped.
    fn register(
        &self,
        key: AssetKey,
        lane: Lane,
        waiter: Option<Waiter>,
        prebuilt: Option<reqwest::Request>,
    ) -> Result<bool, Option<Waiter>> {
        let mut registry = self.shared.registry.lock();
        if registry.stopped {
            return Err(waiter);
        }

        if let Some(request) = registry.requests.get_mut(&key) {
            if let Some(waiter) = waiter {
                request.waiters.push(waiter);
            }
            if lane == Lane::OnDemand
                && request.lane == Lane::Background
                && request.state == RequestState::Queued
            {
                request.lane = Lane::OnDemand;
                debug!(url = %key, "Promoting background request to on-demand lane");
                let _ = self.on_demand_tx.send(Job {
                    key,
                    id: request.id,
                });
            }
            return Ok(false);
        }

        // A download may have finished between the caller's cache check and
        // taking the lock; completions store before leaving the registry.
        if self.shared.store.peek(&key).is_some() {
            return Err(waiter);
        }

        registry.next_id += 1;
        let id = registry.next_id;
        registry.requests.insert(
            key.clone(),
            DownloadRequest {
                id,
                waiters: waiter.into_iter().collect(),
                state: RequestState::Queued,
                lane,
                enqueued_at: Instant::now(),
                cancel: self.shared.shutdown.child_token(),
                prebuilt,
            },
        );
        self.shared.total_requested.fetch_add(1, Ordering::Relaxed);

        let job = Job { key, id };
        let sent = match lane {
            Lane::OnDemand => self.on_demand_tx.send(job),
            Lane::Background => self.background_tx.send(job),
        };
        if let Err(mpsc::error::SendError(job)) = sent {
            warn!(url = %job.key, "Scheduler loop is gone, dropping request");
        }
        Ok(true)
    }

    /// Cancel the request for `key`. Every waiter is notified with `None`
    /// and the request leaves the registry immediately. Returns whether a
    /// request existed.
    pub fn cancel(&self, key: &AssetKey) -> bool {
        let request = self.shared.registry.lock().requests.remove(key);
        let Some(request) = request else {
            return false;
        };

        request.cancel.cancel();
        debug!(url = %key, waiters = request.waiters.len(), state = ?request.state, "Download request cancelled");
        for waiter in request.waiters {
            waiter.notify(key, None);
        }
        true
    }

    /// Whether a request for `key` is queued or in flight
    pub fn is_pending(&self, key: &AssetKey) -> bool {
        self.shared.registry.lock().requests.contains_key(key)
    }

    pub fn request_state(&self, key: &AssetKey) -> Option<RequestState> {
        self.shared
            .registry
            .lock()
            .requests
            .get(key)
            .map(|request| request.state)
    }

    /// Pause or resume the background lane. Paused work stays queued.
    pub fn set_background_enabled(&self, enabled: bool) {
        let previous = self.shared.background_enabled.send_replace(enabled);
        if previous != enabled {
            info!(enabled, "Background caching toggled");
        }
    }

    pub fn background_enabled(&self) -> bool {
        *self.shared.background_enabled.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssetEvent> {
        self.shared.events.subscribe()
    }

    pub fn counters(&self) -> CacheCounters {
        let background_enabled = self.background_enabled();
        let registry = self.shared.registry.lock();

        let current_cache_state = if registry.stopped {
            CacheState::Stopped
        } else if registry.requests.is_empty() {
            CacheState::Idle
        } else if !background_enabled
            && registry.requests.values().all(|request| {
                request.lane == Lane::Background && request.state == RequestState::Queued
            })
        {
            CacheState::Paused
        } else {
            CacheState::Caching
        };

        CacheCounters {
            remaining_queued_items: registry.requests.len(),
            total_requested_items: self.shared.total_requested.load(Ordering::Relaxed),
            current_cache_state,
            last_sampled_speed: self.shared.monitor.last_sampled_speed(),
            current_network_state: self.shared.monitor.current_classification(),
        }
    }

    /// Stop the run loop, cancel in-flight tasks and notify every remaining
    /// waiter with `None`. Later enqueues are answered with `None` at once.
    pub async fn shutdown(&self) {
        let requests = {
            let mut registry = self.shared.registry.lock();
            registry.stopped = true;
            std::mem::take(&mut registry.requests)
        };
        self.shared.shutdown.cancel();

        let pending = requests.len();
        for (key, request) in requests {
            for waiter in request.waiters {
                waiter.notify(&key, None);
            }
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        info!(pending, "Download scheduler shut down");
    }
}

impl Drop for DownloadScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    async fn run(
        self: Arc<Self>,
        mut on_demand_rx: mpsc::UnboundedReceiver<Job>,
        mut background_rx: mpsc::UnboundedReceiver<Job>,
    ) {
        info!("Download scheduler started");
        let mut in_flight = FuturesUnordered::new();
        let mut background_enabled = self.background_enabled.subscribe();

        loop {
            let limit = self
                .config
                .concurrency_for(self.monitor.current_classification());
            let has_capacity = in_flight.len() < limit;
            let background_open = *background_enabled.borrow_and_update();

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!(in_flight = in_flight.len(), "Shutdown requested, dropping in-flight tasks");
                    break;
                }

                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}

                Some(job) = on_demand_rx.recv(), if has_capacity => {
                    if let Some(task) = self.begin(job, limit) {
                        in_flight.push(Arc::clone(&self).execute(task));
                    }
                }

                Some(job) = background_rx.recv(), if has_capacity && background_open => {
                    if let Some(task) = self.begin(job, limit) {
                        in_flight.push(Arc::clone(&self).execute(task));
                    }
                }

                // Wake up to re-evaluate the background gate.
                Ok(()) = background_enabled.changed() => {}

                else => {
                    info!("All lanes closed. Download scheduler shutting down.");
                    break;
                }
            }
        }
        info!("Download scheduler finished");
    }

    // Move a queued request to in-flight. Stale jobs (cancelled, replaced or
    // already started through the other lane) are skipped.
    fn begin(&self, job: Job, limit: usize) -> Option<(u64, ConnectionTask)> {
        let mut registry = self.registry.lock();
        let request = registry.requests.get_mut(&job.key)?;
        if request.id != job.id || request.state != RequestState::Queued {
            return None;
        }
        request.state = RequestState::InFlight;
        debug!(
            url = %job.key,
            lane = ?request.lane,
            waited_ms = request.enqueued_at.elapsed().as_millis() as u64,
            limit,
            "Starting connection task"
        );

        let task = ConnectionTask::new(
            job.key,
            Arc::clone(&self.fetcher),
            request.cancel.clone(),
            self.activity.clone(),
        )
        .with_request(request.prebuilt.take());
        Some((job.id, task))
    }

    async fn execute(self: Arc<Self>, (id, task): (u64, ConnectionTask)) {
        let key = task.key().clone();

        let data = match task.run().await {
            // Waiters were already notified by whoever cancelled.
            TaskOutcome::Cancelled(_) => return,
            TaskOutcome::Succeeded(result) => match result.bytes {
                Some(bytes) => {
                    if let Err(e) = self.store.store(&key, bytes.clone()).await {
                        warn!(url = %key, error = %e, "Write-through failed, serving from memory only");
                    }
                    self.monitor
                        .record_sample(bytes.len() as u64, result.duration);
                    Some(bytes)
                }
                None => None,
            },
            TaskOutcome::Failed(result, e) => {
                debug!(url = %key, status = ?result.http_status, error = %e, "Download failed, notifying waiters with no data");
                None
            }
        };

        self.finish(&key, id, data);
    }

    fn finish(&self, key: &AssetKey, id: u64, data: Option<Bytes>) {
        let request = {
            let mut registry = self.registry.lock();
            let current = registry
                .requests
                .get(key)
                .is_some_and(|request| request.id == id);
            if current {
                registry.requests.remove(key)
            } else {
                None
            }
        };
        let Some(mut request) = request else {
            debug!(url = %key, "Request left the registry before completion");
            return;
        };

        request.state = if data.is_some() {
            RequestState::Completed
        } else {
            RequestState::Failed
        };
        debug!(url = %key, state = ?request.state, waiters = request.waiters.len(), "Download request finished");

        for waiter in request.waiters {
            waiter.notify(key, data.clone());
        }
        let _ = self.events.send(AssetEvent::DownloadComplete {
            url: key.clone(),
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, MemoryIndex};
    use crate::config::MonitorConfig;
    use crate::connection::FetchedAsset;
    use crate::error::AssetError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    #[inline]
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    /// Counts calls and tracks peak concurrency
    struct FakeFetcher {
        calls: AtomicUsize,
        current: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        body: Bytes,
        status: u16,
        log: Mutex<Vec<AssetKey>>,
        prebuilt: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(delay: Duration, body: &'static [u8]) -> Arc<Self> {
            Self::with_status(delay, body, 200)
        }

        fn with_status(delay: Duration, body: &'static [u8], status: u16) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
                body: Bytes::from_static(body),
                status,
                log: Mutex::new(Vec::new()),
                prebuilt: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AssetFetcher for FakeFetcher {
        async fn fetch(
            &self,
            key: &AssetKey,
            request: Option<reqwest::Request>,
        ) -> Result<FetchedAsset, AssetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(key.clone());
            if request.is_some() {
                self.prebuilt.fetch_add(1, Ordering::SeqCst);
            }
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if (200..300).contains(&self.status) {
                Ok(FetchedAsset {
                    status: self.status,
                    body: self.body.clone(),
                })
            } else {
                Err(AssetError::HttpStatus(
                    reqwest::StatusCode::from_u16(self.status).unwrap(),
                ))
            }
        }
    }

    struct Harness {
        scheduler: DownloadScheduler,
        store: Arc<TieredCacheStore>,
        monitor: Arc<NetworkSpeedMonitor>,
        activity: NetworkActivity,
        _dir: TempDir,
    }

    async fn harness(fetcher: Arc<FakeFetcher>, config: StashConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            TieredCacheStore::with_index(
                CacheConfig::default(),
                dir.path(),
                Arc::new(MemoryIndex::new()),
            )
            .await
            .unwrap(),
        );
        let monitor = Arc::new(NetworkSpeedMonitor::new(config.monitor.clone()));
        let activity = NetworkActivity::new();
        let scheduler = DownloadScheduler::start(
            Arc::clone(&store),
            fetcher,
            Arc::clone(&monitor),
            activity.clone(),
            &config,
        );
        Harness {
            scheduler,
            store,
            monitor,
            activity,
            _dir: dir,
        }
    }

    fn key(name: &str) -> AssetKey {
        AssetKey::new(format!("https://cdn.example.com/{name}"))
    }

    fn wait(h: &Harness, k: &AssetKey, lane: Lane) -> oneshot::Receiver<Option<Bytes>> {
        let (waiter, rx) = Waiter::channel();
        h.scheduler.enqueue(k.clone(), lane, waiter);
        rx
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_share_one_fetch() {
        init_tracing();
        let fetcher = FakeFetcher::new(Duration::from_millis(50), b"pixels");
        let h = harness(Arc::clone(&fetcher), StashConfig::default()).await;
        let k = key("a.png");

        let first = wait(&h, &k, Lane::OnDemand);
        let second = wait(&h, &k, Lane::OnDemand);

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap(), Some(Bytes::from_static(b"pixels")));
        assert_eq!(second.unwrap(), Some(Bytes::from_static(b"pixels")));
        assert_eq!(fetcher.calls(), 1);
        assert!(!h.scheduler.is_pending(&k));
        assert_eq!(h.activity.in_progress(), 0);
    }

    #[tokio::test]
    async fn test_prebuilt_request_reaches_fetcher_once() {
        // reqwest is built without a default TLS provider; install one for Client::new().
        let _ = rustls::crypto::ring::default_provider().install_default();
        let fetcher = FakeFetcher::new(Duration::from_millis(20), b"pixels");
        let h = harness(Arc::clone(&fetcher), StashConfig::default()).await;
        let k = key("private.png");
        let client = reqwest::Client::new();
        let build = || client.get(k.as_str()).bearer_auth("t").build().unwrap();

        let (first, first_rx) = Waiter::channel();
        let (second, second_rx) = Waiter::channel();
        h.scheduler.enqueue_request(build(), Lane::OnDemand, first);
        h.scheduler.enqueue_request(build(), Lane::OnDemand, second);
        assert!(h.scheduler.is_pending(&k));

        assert_eq!(first_rx.await.unwrap(), Some(Bytes::from_static(b"pixels")));
        assert_eq!(second_rx.await.unwrap(), Some(Bytes::from_static(b"pixels")));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(fetcher.prebuilt.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.peek(&k), Some(Bytes::from_static(b"pixels")));
    }

    #[tokio::test]
    async fn test_success_writes_through_and_samples() {
        let fetcher = FakeFetcher::new(Duration::from_millis(5), b"pixels");
        let h = harness(Arc::clone(&fetcher), StashConfig::default()).await;
        let k = key("a.png");

        wait(&h, &k, Lane::OnDemand).await.unwrap();
        assert_eq!(h.store.peek(&k), Some(Bytes::from_static(b"pixels")));
        assert!(h.store.durable_record(&k).await.is_some());
        assert_eq!(h.monitor.sample_count(), 1);

        // Cached now: no second fetch.
        let again = wait(&h, &k, Lane::OnDemand).await.unwrap();
        assert_eq!(again, Some(Bytes::from_static(b"pixels")));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_not_found_delivers_none_and_caches_nothing() {
        let fetcher = FakeFetcher::with_status(Duration::from_millis(5), b"", 404);
        let h = harness(Arc::clone(&fetcher), StashConfig::default()).await;
        let k = key("missing.png");

        let called = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = oneshot::channel();
        {
            let called = Arc::clone(&called);
            h.scheduler.enqueue(
                k.clone(),
                Lane::OnDemand,
                Waiter::callback(move |url, data| {
                    *called.lock() = Some((url.clone(), data));
                    let _ = done_tx.send(());
                }),
            );
        }
        done_rx.await.unwrap();

        assert_eq!(*called.lock(), Some((k.clone(), None)));
        assert!(h.store.peek(&k).is_none());
        assert!(h.store.durable_record(&k).await.is_none());
        assert_eq!(h.monitor.sample_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_notifies_every_waiter() {
        let fetcher = FakeFetcher::new(Duration::from_secs(10), b"late");
        let h = harness(Arc::clone(&fetcher), StashConfig::default()).await;
        let k = key("slow.png");

        let first = wait(&h, &k, Lane::OnDemand);
        let second = wait(&h, &k, Lane::OnDemand);

        let mut activity = h.activity.subscribe();
        activity.wait_for(|count| *count == 1).await.unwrap();
        assert_eq!(h.scheduler.request_state(&k), Some(RequestState::InFlight));

        assert!(h.scheduler.cancel(&k));
        assert_eq!(first.await.unwrap(), None);
        assert_eq!(second.await.unwrap(), None);
        assert!(!h.scheduler.is_pending(&k));
        assert!(!h.scheduler.cancel(&k));

        activity.wait_for(|count| *count == 0).await.unwrap();
        assert!(h.store.peek(&k).is_none());
    }

    #[tokio::test]
    async fn test_cancel_queued_request_never_fetches() {
        let fetcher = FakeFetcher::new(Duration::from_millis(5), b"x");
        let config = StashConfig {
            background_caching: false,
            ..Default::default()
        };
        let h = harness(Arc::clone(&fetcher), config).await;
        let k = key("queued.png");

        assert_eq!(h.scheduler.enqueue_batch([k.clone()]), 1);
        assert!(h.scheduler.cancel(&k));
        h.scheduler.set_background_enabled(true);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls(), 0);
    }

    async fn peak_for(seed_bytes: u64, body: &'static [u8]) -> usize {
        let fetcher = FakeFetcher::new(Duration::from_millis(50), body);
        let config = StashConfig {
            scheduler: SchedulerConfig {
                poor_concurrency: 1,
                average_concurrency: 2,
                optimal_concurrency: 3,
            },
            monitor: MonitorConfig {
                rolling_size: 4,
                poor_threshold: 1_000.0,
                optimal_threshold: 10_000.0,
            },
            ..Default::default()
        };
        let h = harness(Arc::clone(&fetcher), config).await;
        h.monitor.record_sample(seed_bytes, Duration::from_secs(1));

        let mut events = h.scheduler.subscribe();
        let keys = vec![key("1.png"), key("2.png"), key("3.png")];
        assert_eq!(h.scheduler.enqueue_batch(keys), 3);
        for _ in 0..3 {
            events.recv().await.unwrap();
        }
        assert_eq!(fetcher.calls(), 3);
        fetcher.peak()
    }

    #[tokio::test]
    async fn test_poor_network_runs_fewer_tasks_than_optimal() {
        static LARGE: [u8; 20_000] = [7u8; 20_000];
        let poor = peak_for(10, b"x").await;
        let optimal = peak_for(1_000_000, &LARGE).await;
        assert_eq!(poor, 1);
        assert_eq!(optimal, 3);
        assert!(poor < optimal);
    }

    #[tokio::test]
    async fn test_background_paused_until_enabled() {
        let fetcher = FakeFetcher::new(Duration::from_millis(5), b"x");
        let config = StashConfig {
            background_caching: false,
            ..Default::default()
        };
        let h = harness(Arc::clone(&fetcher), config).await;
        let k = key("prefetch.png");

        h.scheduler.enqueue_batch([k.clone()]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(h.scheduler.counters().current_cache_state, CacheState::Paused);
        assert_eq!(h.scheduler.request_state(&k), Some(RequestState::Queued));

        let mut events = h.scheduler.subscribe();
        h.scheduler.set_background_enabled(true);
        events.recv().await.unwrap();
        assert_eq!(fetcher.calls(), 1);
        assert!(h.store.peek(&k).is_some());
    }

    #[tokio::test]
    async fn test_on_demand_promotes_paused_background_request() {
        let fetcher = FakeFetcher::new(Duration::from_millis(5), b"x");
        let config = StashConfig {
            background_caching: false,
            ..Default::default()
        };
        let h = harness(Arc::clone(&fetcher), config).await;
        let k = key("shared.png");

        h.scheduler.enqueue_batch([k.clone()]);
        let data = wait(&h, &k, Lane::OnDemand).await.unwrap();
        assert_eq!(data, Some(Bytes::from_static(b"x")));
        assert_eq!(fetcher.calls(), 1);

        // The stale background job is skipped once the lane reopens.
        h.scheduler.set_background_enabled(true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_on_demand_lane_drains_first() {
        let fetcher = FakeFetcher::new(Duration::from_millis(20), b"x");
        let config = StashConfig {
            scheduler: SchedulerConfig {
                poor_concurrency: 1,
                average_concurrency: 1,
                optimal_concurrency: 1,
            },
            background_caching: false,
            ..Default::default()
        };
        let h = harness(Arc::clone(&fetcher), config).await;

        h.scheduler
            .enqueue_batch([key("bg-1.png"), key("bg-2.png")]);
        let on_demand = wait(&h, &key("now.png"), Lane::OnDemand);
        h.scheduler.set_background_enabled(true);

        on_demand.await.unwrap();
        let mut events = h.scheduler.subscribe();
        while h.scheduler.counters().remaining_queued_items > 0 {
            events.recv().await.unwrap();
        }

        let log = fetcher.log.lock().clone();
        assert_eq!(log.first(), Some(&key("now.png")));
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn test_batch_skips_cached_and_in_flight() {
        let fetcher = FakeFetcher::new(Duration::from_millis(5), b"x");
        let config = StashConfig {
            background_caching: false,
            ..Default::default()
        };
        let h = harness(Arc::clone(&fetcher), config).await;

        h.store
            .store(&key("cached.png"), Bytes::from_static(b"c"))
            .await
            .unwrap();
        assert_eq!(h.scheduler.enqueue_batch([key("queued.png")]), 1);

        let created = h.scheduler.enqueue_batch([
            key("cached.png"),
            key("queued.png"),
            key("new.png"),
        ]);
        assert_eq!(created, 1);
        assert_eq!(h.scheduler.counters().total_requested_items, 2);
    }

    #[tokio::test]
    async fn test_counters_report_state() {
        let fetcher = FakeFetcher::new(Duration::from_millis(5), b"pixels");
        let h = harness(Arc::clone(&fetcher), StashConfig::default()).await;

        let idle = h.scheduler.counters();
        assert_eq!(idle.current_cache_state, CacheState::Idle);
        assert_eq!(idle.current_network_state, NetworkClassification::Average);

        wait(&h, &key("a.png"), Lane::OnDemand).await.unwrap();
        let counters = h.scheduler.counters();
        assert_eq!(counters.total_requested_items, 1);
        assert_eq!(counters.remaining_queued_items, 0);
        assert!(counters.last_sampled_speed > 0.0);

        let json = serde_json::to_value(&counters).unwrap();
        assert_eq!(json["current_cache_state"], "idle");
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_rejects() {
        let fetcher = FakeFetcher::new(Duration::from_secs(10), b"late");
        let h = harness(Arc::clone(&fetcher), StashConfig::default()).await;

        let pending = wait(&h, &key("slow.png"), Lane::OnDemand);
        h.scheduler.shutdown().await;
        assert_eq!(pending.await.unwrap(), None);
        assert_eq!(h.activity.in_progress(), 0);

        let after = wait(&h, &key("other.png"), Lane::OnDemand);
        assert_eq!(after.await.unwrap(), None);
        assert_eq!(h.scheduler.counters().current_cache_state, CacheState::Stopped);
    }
}
