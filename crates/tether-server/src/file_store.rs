use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use tether_shared::routes::validate_hash;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(&canonical_base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Content-addressed file storage: one file per hash, named by the
/// uppercased hash.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
    max_size: usize,
}

impl FileStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::Storage(format!(
                "Failed to create file directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "File store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn store(&self, hash: &str, data: &[u8]) -> Result<(), ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty file".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::FileTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let path = self.file_path(hash)?;
        fs::write(&path, data)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to write {}: {}", hash, e)))?;

        debug!(hash, size = data.len(), "Stored file");
        Ok(())
    }

    pub async fn get(&self, hash: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.file_path(hash)?;
        if !path.exists() {
            return Err(ServerError::FileNotFound(hash.to_string()));
        }
        fs::read(&path)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to read {}: {}", hash, e)))
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.file_path(hash).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Remove every stored file. Returns how many were removed.
    pub async fn delete_all(&self) -> Result<usize, ServerError> {
        let mut removed = 0;
        for hash in self.list().await? {
            let path = self.file_path(&hash)?;
            fs::remove_file(&path)
                .await
                .map_err(|e| ServerError::Storage(format!("Failed to delete {}: {}", hash, e)))?;
            removed += 1;
        }
        info!(removed, "Deleted all files");
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<String>, ServerError> {
        let mut hashes = Vec::new();
        let mut entries = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to list files: {}", e)))?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ServerError::Storage(format!("Failed to read directory entry: {}", e))
        })? {
            if let Some(name) = entry.file_name().to_str() {
                if validate_hash(name).is_ok() {
                    hashes.push(name.to_string());
                }
            }
        }

        Ok(hashes)
    }

    fn file_path(&self, hash: &str) -> Result<PathBuf, ServerError> {
        validate_hash(hash).map_err(|e| ServerError::BadRequest(e.to_string()))?;
        let raw = self.base_path.join(hash.to_ascii_uppercase());
        ensure_within(&self.base_path, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (FileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf(), 1024).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_and_get_ignores_case() {
        let (store, _dir) = test_store().await;
        store.store("abc123", b"payload").await.unwrap();
        assert!(store.exists("ABC123"));
        assert_eq!(store.get("ABC123").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_rejects_non_hex_hash() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.store("../etc", b"x").await,
            Err(ServerError::BadRequest(_))
        ));
        assert!(!store.exists("../etc"));
    }

    #[tokio::test]
    async fn test_size_limit() {
        let (store, _dir) = test_store().await;
        let big = vec![0u8; 2048];
        assert!(matches!(
            store.store("AA", &big).await,
            Err(ServerError::FileTooLarge { size: 2048, max: 1024 })
        ));
        assert!(store.store("AA", b"").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_all() {
        let (store, _dir) = test_store().await;
        store.store("AA", b"1").await.unwrap();
        store.store("BB", b"2").await.unwrap();
        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(store.get("AA").await, Err(ServerError::FileNotFound(_))));
    }
}
