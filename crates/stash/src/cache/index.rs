//! # Durable Index
//!
//! The durable tier's metadata lives behind [`CacheIndex`], an opaque
//! key/record store. The tiered store treats it as the source of truth for
//! which assets are on disk; the asset files themselves are managed
//! separately, so dropping a record does not delete its file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs;
use tokio::io;
use tracing::{debug, warn};

use crate::cache::types::{AssetKey, CacheRecord, CacheResult};

/// Key/record store backing the durable tier
#[async_trait]
pub trait CacheIndex: Send + Sync {
    /// Get the record for `key`
    async fn get(&self, key: &AssetKey) -> CacheResult<Option<CacheRecord>>;

    /// Insert or replace the record for `key`
    async fn put(&self, key: &AssetKey, record: CacheRecord) -> CacheResult<()>;

    /// Remove the record for `key`; missing records are not an error
    async fn delete(&self, key: &AssetKey) -> CacheResult<()>;

    /// Every record currently stored
    async fn list_all(&self) -> CacheResult<Vec<CacheRecord>>;
}

/// Index persisted as one JSON record per key under a directory
#[derive(Debug, Clone)]
pub struct FileIndex {
    index_dir: PathBuf,
    initialized: Arc<AtomicBool>,
}

impl FileIndex {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.index_dir
    }

    pub(crate) async fn ensure_initialized(&self) -> io::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        fs::create_dir_all(&self.index_dir).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn record_path(&self, key: &AssetKey) -> PathBuf {
        // Strip any extension: records are always `<hash>.json`.
        let name = key.to_filename();
        let stem = name.split('.').next().unwrap_or(&name);
        self.index_dir.join(format!("{stem}.json"))
    }

    async fn read_record(&self, path: &Path) -> Option<CacheRecord> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read index record");
                return None;
            }
        };

        match serde_json::from_slice::<CacheRecord>(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to parse index record, removing it");
                let path = path.to_path_buf();
                tokio::spawn(async move {
                    let _ = fs::remove_file(&path).await;
                });
                None
            }
        }
    }
}

#[async_trait]
impl CacheIndex for FileIndex {
    async fn get(&self, key: &AssetKey) -> CacheResult<Option<CacheRecord>> {
        self.ensure_initialized().await?;
        let path = self.record_path(key);
        Ok(self
            .read_record(&path)
            .await
            .filter(|record| &record.key == key))
    }

    async fn put(&self, key: &AssetKey, record: CacheRecord) -> CacheResult<()> {
        self.ensure_initialized().await?;

        let path = self.record_path(key);
        let json = serde_json::to_vec(&record).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize index record: {e}"),
            )
        })?;

        // Write to a temporary file then rename so readers never see a
        // partially written record.
        let temp_path = path.with_extension("tmp");
        if let Err(e) = fs::write(&temp_path, &json).await {
            warn!(path = ?temp_path, error = %e, "Failed to write index record");
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            warn!(from = ?temp_path, to = ?path, error = %e, "Failed to rename index record");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(url = %key, "Index record written");
        Ok(())
    }

    async fn delete(&self, key: &AssetKey) -> CacheResult<()> {
        self.ensure_initialized().await?;
        let path = self.record_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to remove index record");
                Err(e.into())
            }
        }
    }

    async fn list_all(&self) -> CacheResult<Vec<CacheRecord>> {
        self.ensure_initialized().await?;

        let mut entries = fs::read_dir(&self.index_dir).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(record) = self.read_record(&path).await {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Index kept in process memory; nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryIndex {
    records: RwLock<HashMap<AssetKey, CacheRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheIndex for MemoryIndex {
    async fn get(&self, key: &AssetKey) -> CacheResult<Option<CacheRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn put(&self, key: &AssetKey, record: CacheRecord) -> CacheResult<()> {
        self.records.write().insert(key.clone(), record);
        Ok(())
    }

    async fn delete(&self, key: &AssetKey) -> CacheResult<()> {
        self.records.write().remove(key);
        Ok(())
    }

    async fn list_all(&self) -> CacheResult<Vec<CacheRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(url: &str) -> CacheRecord {
        let key = AssetKey::new(url);
        let path = PathBuf::from("/tmp").join(key.to_filename());
        CacheRecord::new(key, path, 42)
    }

    #[tokio::test]
    async fn test_file_index_put_get() {
        let dir = TempDir::new().unwrap();
        let index = FileIndex::new(dir.path().join("index"));
        let rec = record("https://cdn.example.com/a.png");

        index.put(&rec.key, rec.clone()).await.unwrap();
        let loaded = index.get(&rec.key).await.unwrap();
        assert_eq!(loaded, Some(rec));
    }

    #[tokio::test]
    async fn test_file_index_get_missing() {
        let dir = TempDir::new().unwrap();
        let index = FileIndex::new(dir.path());
        let key = AssetKey::new("https://cdn.example.com/none.png");
        assert!(index.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_index_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let index = FileIndex::new(dir.path());
        let rec = record("https://cdn.example.com/a.png");

        index.put(&rec.key, rec.clone()).await.unwrap();
        index.delete(&rec.key).await.unwrap();
        index.delete(&rec.key).await.unwrap();
        assert!(index.get(&rec.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_index_list_all_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let index = FileIndex::new(dir.path());
        let a = record("https://cdn.example.com/a.png");
        let b = record("https://cdn.example.com/b.png");
        index.put(&a.key, a.clone()).await.unwrap();
        index.put(&b.key, b.clone()).await.unwrap();
        fs::write(dir.path().join("broken.json"), b"{not json")
            .await
            .unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").await.unwrap();

        let mut urls: Vec<String> = index
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key.to_string())
            .collect();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example.com/a.png".to_string(),
                "https://cdn.example.com/b.png".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_file_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let rec = record("https://cdn.example.com/a.png");
        FileIndex::new(dir.path())
            .put(&rec.key, rec.clone())
            .await
            .unwrap();

        let reopened = FileIndex::new(dir.path());
        assert_eq!(reopened.get(&rec.key).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn test_memory_index_roundtrip() {
        let index = MemoryIndex::new();
        let rec = record("https://cdn.example.com/a.png");
        index.put(&rec.key, rec.clone()).await.unwrap();
        assert_eq!(index.list_all().await.unwrap().len(), 1);
        index.delete(&rec.key).await.unwrap();
        assert!(index.get(&rec.key).await.unwrap().is_none());
    }
}
