//! Local content-addressed file cache, as seen by the transfer layer.
//!
//! The real cache (scanning, hashing, compression) lives outside this
//! crate. Uploads only need two lookups: metadata by hash, and the
//! compressed bytes for a hash.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_shared::routes::validate_hash;

use crate::error::{Result, TransferError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub hash: String,
    pub resolved_path: PathBuf,
    /// Uncompressed size in bytes.
    pub size: u64,
}

#[async_trait]
pub trait FileCache: Send + Sync {
    fn get_by_hash(&self, hash: &str) -> Option<CacheEntry>;

    /// Compressed bytes for `hash`. Returns `Cancelled` if `cancel` fires
    /// first.
    async fn get_compressed_data(&self, hash: &str, cancel: &CancellationToken) -> Result<Bytes>;
}

/// In-memory cache holding ready-to-upload payloads.
#[derive(Debug, Default)]
pub struct MemoryFileCache {
    entries: DashMap<String, (CacheEntry, Bytes)>,
}

impl MemoryFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, hash: impl Into<String>, data: impl Into<Bytes>) {
        let hash = hash.into();
        let data = data.into();
        let entry = CacheEntry {
            hash: hash.clone(),
            resolved_path: PathBuf::from(format!("memory://{hash}")),
            size: data.len() as u64,
        };
        self.entries.insert(hash, (entry, data));
    }

    pub fn remove(&self, hash: &str) {
        self.entries.remove(hash);
    }
}

#[async_trait]
impl FileCache for MemoryFileCache {
    fn get_by_hash(&self, hash: &str) -> Option<CacheEntry> {
        self.entries.get(hash).map(|e| e.0.clone())
    }

    async fn get_compressed_data(&self, hash: &str, cancel: &CancellationToken) -> Result<Bytes> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.entries
            .get(hash)
            .map(|e| e.1.clone())
            .ok_or_else(|| TransferError::FileMissing(hash.to_string()))
    }
}

/// Directory of files named by their hash, stored as already-compressed
/// payloads.
#[derive(Debug, Clone)]
pub struct DirFileCache {
    root: PathBuf,
}

impl DirFileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, hash: &str) -> Option<PathBuf> {
        validate_hash(hash).ok()?;
        Some(self.root.join(hash))
    }
}

#[async_trait]
impl FileCache for DirFileCache {
    fn get_by_hash(&self, hash: &str) -> Option<CacheEntry> {
        let path = self.path_for(hash)?;
        let meta = std::fs::metadata(&path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(CacheEntry {
            hash: hash.to_string(),
            resolved_path: path,
            size: meta.len(),
        })
    }

    async fn get_compressed_data(&self, hash: &str, cancel: &CancellationToken) -> Result<Bytes> {
        let path = self
            .path_for(hash)
            .ok_or_else(|| TransferError::FileMissing(hash.to_string()))?;
        let data = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            data = fs::read(&path) => data?,
        };
        debug!(hash, size = data.len(), "Read cached payload");
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_cache() {
        let cache = MemoryFileCache::new();
        cache.insert("AA", b"hello".to_vec());
        assert_eq!(cache.get_by_hash("AA").unwrap().size, 5);
        assert!(cache.get_by_hash("BB").is_none());

        let token = CancellationToken::new();
        assert_eq!(&cache.get_compressed_data("AA", &token).await.unwrap()[..], b"hello");
        token.cancel();
        assert!(cache
            .get_compressed_data("AA", &token)
            .await
            .unwrap_err()
            .is_cancelled());
    }

    #[tokio::test]
    async fn test_dir_cache_reads_by_hash() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ABCDEF"), b"payload").unwrap();
        let cache = DirFileCache::new(dir.path());

        let entry = cache.get_by_hash("ABCDEF").unwrap();
        assert_eq!(entry.size, 7);
        assert!(cache.get_by_hash("../ABCDEF").is_none());
        assert!(cache.get_by_hash("012345").is_none());

        let data = cache
            .get_compressed_data("ABCDEF", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&data[..], b"payload");
    }
}
