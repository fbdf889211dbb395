//! Durable blob storage.
//!
//! A path-addressed read/write/list/link abstraction. Paths are relative,
//! `/`-separated strings such as `graph/fetch-users/entities/<uuid>.json`.
//!
//! Implementations:
//! - [`FileBlobStore`]: the local filesystem under a root directory (tokio::fs)
//! - [`MemoryBlobStore`]: a concurrent map, for tests and dry runs

use super::error::{Result, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::Debug;
use std::path::{Component, Path, PathBuf};

// =============================================================================
// LAYOUT
// =============================================================================

/// Name of the run summary at the storage root.
pub const SUMMARY_FILE: &str = "summary.json";

/// The two graph object collections, as they appear in storage paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Entities,
    Relationships,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Entities => "entities",
            Collection::Relationships => "relationships",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `graph/{step_id}/{collection}`
pub fn graph_dir(step_id: &str, collection: Collection) -> String {
    format!("graph/{}/{}", step_id, collection)
}

/// `graph/{step_id}/{collection}/{file_name}`
pub fn graph_file_path(step_id: &str, collection: Collection, file_name: &str) -> String {
    format!("{}/{}", graph_dir(step_id, collection), file_name)
}

/// `index/{collection}/{object_type}`
pub fn index_dir(collection: Collection, object_type: &str) -> String {
    format!("index/{}/{}", collection, object_type)
}

/// `index/{collection}/{object_type}/{file_name}`
pub fn index_file_path(collection: Collection, object_type: &str, file_name: &str) -> String {
    format!("{}/{}", index_dir(collection, object_type), file_name)
}

// =============================================================================
// TRAIT
// =============================================================================

/// Path-addressed durable storage.
#[async_trait]
pub trait BlobStore: Debug + Send + Sync {
    /// Reads a blob. Returns `StorageError::NotFound` if it does not exist.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Writes a blob, creating parent directories and replacing existing content.
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Makes `link` resolve to the content of `target`.
    async fn link(&self, target: &str, link: &str) -> Result<()>;

    /// Lists the blobs directly under `dir`, sorted. A missing directory is empty.
    async fn list(&self, dir: &str) -> Result<Vec<String>>;

    async fn exists(&self, path: &str) -> Result<bool>;
}

// =============================================================================
// FILESYSTEM
// =============================================================================

#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(StorageError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent.display().to_string(), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(path)?;
        tokio::fs::read(&full_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    path: path.to_string(),
                }
            } else {
                StorageError::io(path, e)
            }
        })
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        self.ensure_parent(&full_path).await?;
        tokio::fs::write(&full_path, bytes)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn link(&self, target: &str, link: &str) -> Result<()> {
        let target_path = self.resolve_path(target)?;
        let link_path = self.resolve_path(link)?;
        self.ensure_parent(&link_path).await?;

        #[cfg(unix)]
        {
            let absolute_target = if target_path.is_absolute() {
                target_path
            } else {
                std::env::current_dir()
                    .map_err(|e| StorageError::io(target, e))?
                    .join(target_path)
            };
            tokio::fs::symlink(&absolute_target, &link_path)
                .await
                .map_err(|e| StorageError::io(link, e))
        }

        #[cfg(not(unix))]
        {
            tokio::fs::copy(&target_path, &link_path)
                .await
                .map(|_| ())
                .map_err(|e| StorageError::io(link, e))
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let full_path = self.resolve_path(dir)?;
        let mut entries = match tokio::fs::read_dir(&full_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(dir, e)),
        };

        let mut results = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(dir, e))?
        {
            // Follows symlinks, so index links count as files.
            let metadata = tokio::fs::metadata(entry.path())
                .await
                .map_err(|e| StorageError::io(entry.path().display().to_string(), e))?;
            if metadata.is_file() {
                let name = entry.file_name().to_string_lossy().to_string();
                results.push(format!("{}/{}", dir.trim_end_matches('/'), name));
            }
        }

        results.sort();
        Ok(results)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path)?;
        match tokio::fs::metadata(&full_path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}

// =============================================================================
// MEMORY
// =============================================================================

/// In-memory blob store. Links copy the target's bytes.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.blobs
            .get(path)
            .map(|bytes| bytes.value().clone())
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
            })
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn link(&self, target: &str, link: &str) -> Result<()> {
        let bytes = self.read(target).await?;
        self.blobs.insert(link.to_string(), bytes);
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut results: Vec<String> = self
            .blobs
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|path| {
                path.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .collect();
        results.sort();
        Ok(results)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        assert_eq!(
            graph_file_path("fetch-users", Collection::Entities, "f.json"),
            "graph/fetch-users/entities/f.json"
        );
        assert_eq!(
            index_file_path(Collection::Relationships, "acme_has", "f.json"),
            "index/relationships/acme_has/f.json"
        );
    }

    #[tokio::test]
    async fn test_memory_blob_store_list_is_shallow() {
        let store = MemoryBlobStore::new();
        store.write("index/entities/a/1.json", b"1").await.unwrap();
        store.write("index/entities/a/2.json", b"2").await.unwrap();
        store.write("index/entities/ab/3.json", b"3").await.unwrap();
        store.write("index/entities/a/nested/4.json", b"4").await.unwrap();

        let listed = store.list("index/entities/a").await.unwrap();
        assert_eq!(
            listed,
            vec!["index/entities/a/1.json", "index/entities/a/2.json"]
        );
    }

    #[tokio::test]
    async fn test_memory_blob_store_missing_read() {
        let store = MemoryBlobStore::new();
        let err = store.read("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_file_blob_store_round_trip_and_link() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        store
            .write("graph/s/entities/f.json", b"{\"entities\":[]}")
            .await
            .unwrap();
        store
            .link("graph/s/entities/f.json", "index/entities/t/f.json")
            .await
            .unwrap();

        assert_eq!(
            store.read("index/entities/t/f.json").await.unwrap(),
            b"{\"entities\":[]}"
        );
        assert_eq!(
            store.list("index/entities/t").await.unwrap(),
            vec!["index/entities/t/f.json"]
        );
        assert!(store.exists("graph/s/entities/f.json").await.unwrap());
        assert!(store.list("index/entities/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_blob_store_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        let err = store.read("../secret").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath { .. }));
    }
}
