//! # Tiered Cache Store
//!
//! Coordinates the memory tier and the durable tier. Lookups go memory first,
//! then durable (hydrating memory on a hit). Stores are write-through: the
//! asset file and its index record are committed before `store` returns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::fs;
use tokio::io;
use tracing::{debug, info, warn};

use crate::cache::index::{CacheIndex, FileIndex};
use crate::cache::keys::KeyLocks;
use crate::cache::memory::{AssetLease, MemoryTier, RemoveOutcome};
use crate::cache::types::{AssetKey, CacheConfig, CacheRecord, CacheResult};

const ASSETS_DIR: &str = "assets";
const INDEX_DIR: &str = "index";

/// Point-in-time sizes of both tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TierStats {
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub durable_entries: usize,
}

/// Cache store handling both memory and durable tiers
pub struct TieredCacheStore {
    config: CacheConfig,
    assets_dir: PathBuf,
    memory: MemoryTier,
    index: Arc<dyn CacheIndex>,
    /// In-memory mirror of the durable index, seeded at startup
    records: RwLock<HashMap<AssetKey, CacheRecord>>,
    locks: KeyLocks,
}

impl TieredCacheStore {
    /// Open the store rooted at `cache_dir`, using a [`FileIndex`] under it,
    /// and hydrate from whatever the index already holds.
    pub async fn open(config: CacheConfig, cache_dir: impl AsRef<Path>) -> CacheResult<Self> {
        let cache_dir = cache_dir.as_ref();
        let index = Arc::new(FileIndex::new(cache_dir.join(INDEX_DIR)));
        Self::with_index(config, cache_dir, index).await
    }

    /// Open the store with a caller-supplied durable index
    pub async fn with_index(
        config: CacheConfig,
        cache_dir: impl AsRef<Path>,
        index: Arc<dyn CacheIndex>,
    ) -> CacheResult<Self> {
        let assets_dir = cache_dir.as_ref().join(ASSETS_DIR);
        if config.enabled {
            fs::create_dir_all(&assets_dir).await?;
        }

        let store = Self {
            memory: MemoryTier::new(config.max_memory_bytes),
            locks: KeyLocks::new(config.lock_stripes),
            records: RwLock::new(HashMap::new()),
            assets_dir,
            index,
            config,
        };

        if store.config.enabled {
            store.hydrate().await;
        }
        Ok(store)
    }

    // Load the durable index, dropping records whose file is gone. An
    // unreadable index leaves the mirror empty; records are still reached
    // one at a time through `durable_record`.
    async fn hydrate(&self) {
        let records = match self.index.list_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to list durable index, starting with an empty mirror");
                return;
            }
        };
        let total = records.len();
        let mut kept = HashMap::with_capacity(total);

        for record in records {
            if fs::try_exists(&record.path).await.unwrap_or(false) {
                kept.insert(record.key.clone(), record);
            } else {
                debug!(url = %record.key, path = ?record.path, "Dropping index record with missing file");
                if let Err(e) = self.index.delete(&record.key).await {
                    warn!(url = %record.key, error = %e, "Failed to drop stale index record");
                }
            }
        }

        info!(
            records = kept.len(),
            stale = total - kept.len(),
            "Durable tier hydrated"
        );
        *self.records.write() = kept;
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Local file path for `key`. Pure function of the URL, whether or not
    /// the asset is cached.
    pub fn local_path_for(&self, key: &AssetKey) -> PathBuf {
        self.assets_dir.join(key.to_filename())
    }

    /// Memory tier only; never touches the disk
    pub fn peek(&self, key: &AssetKey) -> Option<Bytes> {
        if !self.config.enabled {
            return None;
        }
        self.memory.get(key)
    }

    /// Look `key` up in memory, then in the durable tier. A durable hit is
    /// hydrated into memory and its record's access counters updated.
    pub async fn lookup(&self, key: &AssetKey) -> Option<Bytes> {
        if !self.config.enabled {
            return None;
        }
        if let Some(data) = self.memory.get(key) {
            return Some(data);
        }

        let _guard = self.locks.lock(key).await;

        // A concurrent hydrate or write-through may have won the lock first.
        if let Some(data) = self.memory.get(key) {
            return Some(data);
        }

        let mut record = self.durable_record(key).await?;
        let data = match fs::read(&record.path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(url = %key, path = ?record.path, "Durable file missing, forgetting record");
                self.forget_record(key).await;
                return None;
            }
            Err(e) => {
                warn!(url = %key, path = ?record.path, error = %e, "Failed to read durable file");
                return None;
            }
        };

        let lease = self.memory.insert(key.clone(), data.clone(), true);
        record.touch();
        self.records.write().insert(key.clone(), record.clone());
        if let Err(e) = self.index.put(key, record).await {
            warn!(url = %key, error = %e, "Failed to update index record access counters");
        }
        drop(lease);

        self.memory.enforce_budget();
        debug!(url = %key, size = data.len(), "Hydrated memory tier from durable tier");
        Some(data)
    }

    /// Write-through store of `data` under `key`, returning the local path.
    ///
    /// If the durable write fails the bytes stay in the memory tier, marked
    /// non-durable, and the error is returned for the caller to log.
    pub async fn store(&self, key: &AssetKey, data: Bytes) -> CacheResult<PathBuf> {
        let path = self.local_path_for(key);
        if !self.config.enabled {
            return Ok(path);
        }

        let _guard = self.locks.lock(key).await;
        let lease = self.memory.insert(key.clone(), data.clone(), true);

        let result = self.persist(key, &data, &path).await;
        if let Err(e) = &result {
            warn!(url = %key, error = %e, "Durable write failed, keeping asset in memory only");
            drop(self.memory.insert(key.clone(), data, false));
        }
        drop(lease);

        self.memory.enforce_budget();
        result.map(|_| path)
    }

    async fn persist(&self, key: &AssetKey, data: &Bytes, path: &Path) -> CacheResult<()> {
        fs::create_dir_all(&self.assets_dir).await?;

        let temp_path = path.with_extension("part");
        if let Err(e) = fs::write(&temp_path, data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        let record = CacheRecord::new(key.clone(), path, data.len() as u64);
        if let Err(e) = self.index.put(key, record.clone()).await {
            // A file without a record is unreachable; don't leave it behind.
            let _ = fs::remove_file(path).await;
            self.records.write().remove(key);
            return Err(e);
        }
        self.records.write().insert(key.clone(), record);

        debug!(url = %key, path = ?path, size = data.len(), "Asset written through to durable tier");
        Ok(())
    }

    /// Pin `key` in the memory tier, hydrating it from disk if needed
    pub async fn lease(&self, key: &AssetKey) -> Option<AssetLease> {
        if let Some(lease) = self.memory.lease(key) {
            return Some(lease);
        }
        self.lookup(key).await?;
        self.memory.lease(key)
    }

    /// Durable record for `key`, from the mirror or the index
    pub async fn durable_record(&self, key: &AssetKey) -> Option<CacheRecord> {
        if let Some(record) = self.records.read().get(key).cloned() {
            return Some(record);
        }
        match self.index.get(key).await {
            Ok(Some(record)) => {
                self.records.write().insert(key.clone(), record.clone());
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(url = %key, error = %e, "Durable index lookup failed");
                None
            }
        }
    }

    async fn forget_record(&self, key: &AssetKey) {
        self.records.write().remove(key);
        if let Err(e) = self.index.delete(key).await {
            warn!(url = %key, error = %e, "Failed to delete index record");
        }
    }

    /// Drop every memory-tier entry that is not in use. Durable copies stay.
    pub fn evict_unused(&self) -> usize {
        self.memory.evict_unused()
    }

    /// Drop the in-memory structures of both tiers: unused memory entries and
    /// the index mirror. Files and index records stay on disk.
    pub fn clear_caches(&self) {
        let evicted = self.memory.evict_unused();
        self.records.write().clear();
        info!(evicted, "In-memory caches cleared");
    }

    /// Delete durable files and records for every asset not in use.
    /// Returns how many assets were flushed.
    pub async fn flush_cache(&self) -> CacheResult<usize> {
        let records = self.index.list_all().await?;
        let mut flushed = 0;

        for record in records {
            let key = record.key.clone();
            let _guard = self.locks.lock(&key).await;

            if self.memory.try_remove(&key) == RemoveOutcome::InUse {
                debug!(url = %key, "Skipping flush of asset in use");
                continue;
            }

            match fs::remove_file(&record.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(url = %key, path = ?record.path, error = %e, "Failed to delete durable file");
                    continue;
                }
            }
            self.forget_record(&key).await;
            flushed += 1;
        }

        info!(flushed, "Durable cache flushed");
        Ok(flushed)
    }

    /// Delete every durable index record. Files already on disk are left
    /// orphaned; this cannot be undone. Unused memory entries are dropped too
    /// so nothing keeps serving an asset the index no longer knows.
    pub async fn clear_persistent_cache_list(&self) -> CacheResult<usize> {
        let records = self.index.list_all().await?;
        let mut removed = 0;
        for record in &records {
            let _guard = self.locks.lock(&record.key).await;
            // Forget the mirror entry first so a lookup racing this loop
            // cannot find the record and write it back.
            self.records.write().remove(&record.key);
            let _ = self.memory.try_remove(&record.key);
            self.index.delete(&record.key).await?;
            removed += 1;
        }
        self.records.write().clear();
        self.memory.evict_unused();

        info!(removed, "Persistent cache list cleared");
        Ok(removed)
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.total_bytes(),
            durable_entries: self.records.read().len(),
        }
    }
}
