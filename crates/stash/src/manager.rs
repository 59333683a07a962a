//! # Asset Manager
//!
//! Entry point tying the tiered store, the download scheduler and the speed
//! monitor together. Construct one per process (or per cache directory) and
//! hand clones of it to whoever needs assets; clones share all state.
//!
//! ```no_run
//! use stash_engine::{AssetManager, StashConfig};
//!
//! # async fn demo() -> Result<(), stash_engine::AssetError> {
//! let manager = AssetManager::new(StashConfig::builder().with_cache_dir("/tmp/assets").build()).await?;
//!
//! if let Some(bytes) = manager.fetch_async("https://example.com/logo.png").await {
//!     println!("{} bytes", bytes.len());
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{AssetKey, AssetLease, CacheResult, TierStats, TieredCacheStore};
use crate::config::StashConfig;
use crate::connection::{AssetFetcher, HttpFetcher, NetworkActivity};
use crate::error::AssetError;
use crate::monitor::NetworkSpeedMonitor;
use crate::scheduler::{AssetEvent, CacheCounters, DownloadScheduler, Lane, Waiter};

/// Host signal asking the cache to release unused memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPressure;

/// Facade over the cache/download subsystem
#[derive(Clone)]
pub struct AssetManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<TieredCacheStore>,
    scheduler: DownloadScheduler,
    monitor: Arc<NetworkSpeedMonitor>,
    activity: NetworkActivity,
    pressure_tx: mpsc::UnboundedSender<MemoryPressure>,
    maintenance: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.maintenance.cancel();
    }
}

impl AssetManager {
    /// Create a manager fetching over HTTP(S)
    pub async fn new(config: StashConfig) -> Result<Self, AssetError> {
        let fetcher = Arc::new(HttpFetcher::from_config(&config.network)?);
        Self::with_fetcher(config, fetcher).await
    }

    /// Create a manager with a custom transfer implementation
    pub async fn with_fetcher(
        config: StashConfig,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Result<Self, AssetError> {
        let cache_dir = config.cache_dir();
        let store = TieredCacheStore::open(config.cache.clone(), &cache_dir).await?;
        info!(cache_dir = ?cache_dir, "Asset cache opened");
        Ok(Self::with_parts(config, Arc::new(store), fetcher))
    }

    /// Assemble a manager from an already opened store.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_parts(
        config: StashConfig,
        store: Arc<TieredCacheStore>,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Self {
        let monitor = Arc::new(NetworkSpeedMonitor::new(config.monitor.clone()));
        let activity = NetworkActivity::new();
        let scheduler = DownloadScheduler::start(
            Arc::clone(&store),
            fetcher,
            Arc::clone(&monitor),
            activity.clone(),
            &config,
        );

        let maintenance = CancellationToken::new();
        let (pressure_tx, pressure_rx) = mpsc::unbounded_channel();
        tokio::spawn(listen_for_pressure(
            Arc::clone(&store),
            pressure_rx,
            maintenance.child_token(),
        ));

        Self {
            inner: Arc::new(Inner {
                store,
                scheduler,
                monitor,
                activity,
                pressure_tx,
                maintenance,
            }),
        }
    }

    /// Deliver `url` to `completion`: from the cache if possible, otherwise
    /// after an on-demand download. `completion` receives `None` when the
    /// asset could not be obtained.
    pub async fn fetch<F>(&self, url: impl Into<AssetKey>, completion: F)
    where
        F: FnOnce(&AssetKey, Option<Bytes>) + Send + 'static,
    {
        let key = url.into();
        if let Some(data) = self.inner.store.lookup(&key).await {
            completion(&key, Some(data));
            return;
        }
        self.inner
            .scheduler
            .enqueue(key, Lane::OnDemand, Waiter::callback(completion));
    }

    /// Awaitable form of [`fetch`](Self::fetch)
    pub async fn fetch_async(&self, url: impl Into<AssetKey>) -> Option<Bytes> {
        let key = url.into();
        if let Some(data) = self.inner.store.lookup(&key).await {
            return Some(data);
        }
        let (waiter, rx) = Waiter::channel();
        self.inner.scheduler.enqueue(key, Lane::OnDemand, waiter);
        rx.await.unwrap_or(None)
    }

    /// Like [`fetch`](Self::fetch), but a download sends the caller-built
    /// `request` (extra headers, auth, another method). The asset is cached
    /// under the request URL.
    pub async fn fetch_request<F>(&self, request: reqwest::Request, completion: F)
    where
        F: FnOnce(&AssetKey, Option<Bytes>) + Send + 'static,
    {
        let key = AssetKey::from(request.url());
        if let Some(data) = self.inner.store.lookup(&key).await {
            completion(&key, Some(data));
            return;
        }
        self.inner
            .scheduler
            .enqueue_request(request, Lane::OnDemand, Waiter::callback(completion));
    }

    /// Awaitable form of [`fetch_request`](Self::fetch_request)
    pub async fn fetch_request_async(&self, request: reqwest::Request) -> Option<Bytes> {
        let key = AssetKey::from(request.url());
        if let Some(data) = self.inner.store.lookup(&key).await {
            return Some(data);
        }
        let (waiter, rx) = Waiter::channel();
        self.inner
            .scheduler
            .enqueue_request(request, Lane::OnDemand, waiter);
        rx.await.unwrap_or(None)
    }

    /// Cache-only lookup. Reads the durable tier on a memory miss but never
    /// touches the network.
    pub async fn get(&self, url: impl Into<AssetKey>) -> Option<Bytes> {
        self.inner.store.lookup(&url.into()).await
    }

    /// Memory-tier lookup; never blocks on I/O
    pub fn peek(&self, url: impl Into<AssetKey>) -> Option<Bytes> {
        self.inner.store.peek(&url.into())
    }

    /// Keep the asset resident in memory until the lease is dropped
    pub async fn lease(&self, url: impl Into<AssetKey>) -> Option<AssetLease> {
        self.inner.store.lease(&url.into()).await
    }

    /// Where the asset lives (or would live) on disk
    pub fn local_path_for(&self, url: impl Into<AssetKey>) -> PathBuf {
        self.inner.store.local_path_for(&url.into())
    }

    /// Prefetch `url` on the background lane. Returns whether a new download
    /// was queued.
    pub async fn queue(&self, url: impl Into<AssetKey>) -> bool {
        self.queue_all([url.into()]).await == 1
    }

    /// Prefetch every URL not already cached or downloading. Returns how many
    /// downloads were queued.
    pub async fn queue_all<I, U>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = U>,
        U: Into<AssetKey>,
    {
        let mut pending = Vec::new();
        for url in urls {
            let key = url.into();
            // Durable hits are not hydrated here; prefetch only cares that
            // the bytes are on disk.
            if self.inner.store.durable_record(&key).await.is_some() {
                continue;
            }
            pending.push(key);
        }
        let queued = self.inner.scheduler.enqueue_batch(pending);
        debug!(queued, "Background prefetch queued");
        queued
    }

    /// Cancel the download for `url`; its waiters receive `None`
    pub fn cancel(&self, url: impl Into<AssetKey>) -> bool {
        self.inner.scheduler.cancel(&url.into())
    }

    /// Drop in-memory cache structures, keeping files on disk
    pub fn clear_caches(&self) {
        self.inner.store.clear_caches();
    }

    /// Delete durable files for every asset not in use
    pub async fn flush_cache(&self) -> CacheResult<usize> {
        self.inner.store.flush_cache().await
    }

    /// Delete every durable index record, orphaning files on disk
    pub async fn clear_persistent_cache_list(&self) -> CacheResult<usize> {
        self.inner.store.clear_persistent_cache_list().await
    }

    /// Run the memory-pressure sweep now
    pub fn evict_unused(&self) -> usize {
        self.inner.store.evict_unused()
    }

    /// Sender the host can use to signal memory pressure
    pub fn memory_pressure_sender(&self) -> mpsc::UnboundedSender<MemoryPressure> {
        self.inner.pressure_tx.clone()
    }

    /// Run the memory-pressure sweep every `interval` until shutdown
    pub fn start_maintenance_task(&self, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(&self.inner.store);
        let token = self.inner.maintenance.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.evict_unused();
                        debug!(evicted, "Periodic memory sweep");
                    }
                }
            }
        })
    }

    /// Allow or pause background prefetching (e.g. while the host is
    /// inactive). Paused work is kept, not cancelled.
    pub fn set_background_caching(&self, enabled: bool) {
        self.inner.scheduler.set_background_enabled(enabled);
    }

    pub fn background_caching(&self) -> bool {
        self.inner.scheduler.background_enabled()
    }

    pub fn counters(&self) -> CacheCounters {
        self.inner.scheduler.counters()
    }

    pub fn stats(&self) -> TierStats {
        self.inner.store.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssetEvent> {
        self.inner.scheduler.subscribe()
    }

    pub fn network_activity(&self) -> NetworkActivity {
        self.inner.activity.clone()
    }

    pub fn monitor(&self) -> &NetworkSpeedMonitor {
        &self.inner.monitor
    }

    /// Stop background work and answer every pending waiter with `None`
    pub async fn shutdown(&self) {
        self.inner.maintenance.cancel();
        self.inner.scheduler.shutdown().await;
    }
}

async fn listen_for_pressure(
    store: Arc<TieredCacheStore>,
    mut rx: mpsc::UnboundedReceiver<MemoryPressure>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            signal = rx.recv() => match signal {
                Some(MemoryPressure) => {
                    let evicted = store.evict_unused();
                    info!(evicted, "Memory pressure signalled");
                }
                None => break,
            },
        }
    }
}
