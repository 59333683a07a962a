//! # Memory Tier
//!
//! Volatile, pressure-aware tier holding asset bytes keyed by URL.
//!
//! Every entry carries a use count. While it is above zero the entry is "in
//! use" and no sweep may remove it; [`AssetLease`] guards hold the count up
//! for as long as a caller needs the bytes to stay resident. The tier is an
//! accelerator over the durable tier, never the authoritative copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::cache::types::AssetKey;

/// Entry in the memory tier
#[derive(Debug)]
pub struct MemoryEntry {
    data: Bytes,
    /// Shared with leases and carried across replacement of the same key
    use_count: Arc<AtomicUsize>,
    last_access: Mutex<Instant>,
    hits: AtomicU64,
    /// False when the durable write failed; the entry then lives only here
    durable: bool,
}

impl MemoryEntry {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::Acquire)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Keeps an entry's use count above zero until dropped.
#[derive(Debug)]
pub struct AssetLease {
    key: AssetKey,
    data: Bytes,
    use_count: Arc<AtomicUsize>,
}

impl AssetLease {
    fn acquire(key: AssetKey, entry: &MemoryEntry) -> Self {
        entry.use_count.fetch_add(1, Ordering::AcqRel);
        Self {
            key,
            data: entry.data.clone(),
            use_count: Arc::clone(&entry.use_count),
        }
    }

    pub fn key(&self) -> &AssetKey {
        &self.key
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl Drop for AssetLease {
    fn drop(&mut self) {
        self.use_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Outcome of [`MemoryTier::try_remove`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    InUse,
    Absent,
}

/// Memory tier implementation
#[derive(Debug)]
pub struct MemoryTier {
    entries: RwLock<HashMap<AssetKey, Arc<MemoryEntry>>>,
    /// Soft budget in bytes, zero for unbounded
    max_bytes: u64,
    current_bytes: AtomicU64,
}

impl MemoryTier {
    pub fn new(max_bytes: u64) -> Self {
        debug!(max_bytes, "Memory tier created");
        Self {
            entries: RwLock::new(HashMap::new()),
            max_bytes,
            current_bytes: AtomicU64::new(0),
        }
    }

    /// Return the bytes for `key`, recording the access
    pub fn get(&self, key: &AssetKey) -> Option<Bytes> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        entry.touch();
        Some(entry.data.clone())
    }

    pub fn contains(&self, key: &AssetKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn entry(&self, key: &AssetKey) -> Option<Arc<MemoryEntry>> {
        self.entries.read().get(key).cloned()
    }

    /// Pin the entry for `key`, if resident
    pub fn lease(&self, key: &AssetKey) -> Option<AssetLease> {
        // Read lock excludes sweeps, which take the write lock.
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        entry.touch();
        Some(AssetLease::acquire(key.clone(), entry))
    }

    /// Insert or replace the entry for `key` and return a lease on it.
    ///
    /// The lease protects the entry while the caller finishes any durable
    /// write; dropping it immediately is fine for plain inserts.
    pub fn insert(&self, key: AssetKey, data: Bytes, durable: bool) -> AssetLease {
        let mut entries = self.entries.write();

        let use_count = match entries.get(&key) {
            Some(previous) => {
                self.current_bytes
                    .fetch_sub(previous.size(), Ordering::AcqRel);
                Arc::clone(&previous.use_count)
            }
            None => Arc::new(AtomicUsize::new(0)),
        };

        let entry = Arc::new(MemoryEntry {
            data,
            use_count,
            last_access: Mutex::new(Instant::now()),
            hits: AtomicU64::new(0),
            durable,
        });
        self.current_bytes.fetch_add(entry.size(), Ordering::AcqRel);
        let lease = AssetLease::acquire(key.clone(), &entry);
        entries.insert(key, entry);
        lease
    }

    /// Remove `key` unless it is in use
    pub fn try_remove(&self, key: &AssetKey) -> RemoveOutcome {
        let mut entries = self.entries.write();
        match entries.get(key) {
            None => return RemoveOutcome::Absent,
            Some(entry) if entry.use_count() > 0 => return RemoveOutcome::InUse,
            Some(_) => {}
        }
        if let Some(entry) = entries.remove(key) {
            self.current_bytes.fetch_sub(entry.size(), Ordering::AcqRel);
        }
        RemoveOutcome::Removed
    }

    /// Whether `key` is resident with a use count above zero
    pub fn is_in_use(&self, key: &AssetKey) -> bool {
        self.entries
            .read()
            .get(key)
            .is_some_and(|entry| entry.use_count() > 0)
    }

    /// Remove every entry whose use count is zero. Returns the number removed.
    pub fn evict_unused(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let mut freed = 0u64;
        entries.retain(|_, entry| {
            let keep = entry.use_count() > 0;
            if !keep {
                freed += entry.size();
            }
            keep
        });
        self.current_bytes.fetch_sub(freed, Ordering::AcqRel);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, freed, "Evicted unused memory entries");
        }
        removed
    }

    /// Evict unused entries, least recently accessed first, until the tier
    /// is within its budget. Entries in use are skipped even if that leaves
    /// the tier over budget.
    pub fn enforce_budget(&self) -> usize {
        if self.max_bytes == 0 || self.total_bytes() <= self.max_bytes {
            return 0;
        }

        let mut entries = self.entries.write();
        let mut candidates: Vec<(AssetKey, Instant, u64)> = entries
            .iter()
            .filter(|(_, entry)| entry.use_count() == 0)
            .map(|(key, entry)| (key.clone(), entry.last_access(), entry.size()))
            .collect();
        candidates.sort_by_key(|(_, last_access, _)| *last_access);

        let mut removed = 0;
        for (key, _, size) in candidates {
            if self.current_bytes.load(Ordering::Acquire) <= self.max_bytes {
                break;
            }
            entries.remove(&key);
            self.current_bytes.fetch_sub(size, Ordering::AcqRel);
            removed += 1;
        }

        debug!(
            removed,
            total_bytes = self.current_bytes.load(Ordering::Acquire),
            max_bytes = self.max_bytes,
            "Memory tier budget enforced"
        );
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Acquire)
    }
}
