//! # Cache Types
//!
//! Types shared by the memory tier, the durable index and the tiered store.

use std::borrow::Borrow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AssetError;

/// Cache key identifying a remote asset by its exact URL string.
///
/// No normalization is applied: `http://a/x.png` and `http://a/x.png?` are
/// different assets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(Arc<str>);

impl AssetKey {
    pub fn new(url: impl AsRef<str>) -> Self {
        Self(Arc::from(url.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to a filename-safe string: the SHA-256 of the URL, plus the
    /// URL path's extension when it has a short alphanumeric one.
    pub fn to_filename(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let hash = hasher.finalize();

        match self.extension() {
            Some(ext) => format!("{hash:x}.{ext}"),
            None => format!("{hash:x}"),
        }
    }

    fn extension(&self) -> Option<String> {
        let url = url::Url::parse(&self.0).ok()?;
        let last = url.path_segments()?.next_back()?;
        let (_, ext) = last.rsplit_once('.')?;
        let valid = !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
        valid.then(|| ext.to_ascii_lowercase())
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetKey {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for AssetKey {
    fn from(url: String) -> Self {
        Self(Arc::from(url))
    }
}

impl From<&url::Url> for AssetKey {
    fn from(url: &url::Url) -> Self {
        Self::new(url.as_str())
    }
}

impl Borrow<str> for AssetKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Durable-tier metadata record, persisted by the index collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: AssetKey,
    /// Local file holding the asset bytes
    pub path: PathBuf,
    /// Size of the file in bytes
    pub size: u64,
    /// When the asset was first stored (unix seconds)
    pub cached_at: u64,
    /// Last time the asset was served from the durable tier (unix seconds)
    pub last_access: u64,
    /// How many times the asset has been requested from the durable tier
    pub request_count: u64,
}

impl CacheRecord {
    pub fn new(key: AssetKey, path: impl AsRef<Path>, size: u64) -> Self {
        let now = now_secs();
        Self {
            key,
            path: path.as_ref().to_path_buf(),
            size,
            cached_at: now,
            last_access: now,
            request_count: 0,
        }
    }

    /// Record one more request against this asset
    pub fn touch(&mut self) {
        self.last_access = now_secs();
        self.request_count = self.request_count.saturating_add(1);
    }
}

/// Overall activity of the cache, exposed through the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// Nothing queued or in flight
    #[default]
    Idle,
    /// At least one download queued or in flight
    Caching,
    /// Only background work remains and the background lane is paused
    Paused,
    /// The scheduler has been shut down
    Stopped,
}

/// Configuration for the cache tiers
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,
    /// Directory for durable-tier files and the index; system temp if None
    pub cache_dir: Option<PathBuf>,
    /// Soft budget for the memory tier in bytes, zero for unbounded
    pub max_memory_bytes: u64,
    /// Number of lock stripes serializing per-key mutations
    pub lock_stripes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: None,
            max_memory_bytes: 30 * 1024 * 1024, // 30MB
            lock_stripes: 64,
        }
    }
}

/// Result of a cache operation
pub type CacheResult<T> = std::result::Result<T, AssetError>;

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
