//! On-disk cache store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<sha256(generation)>/generation.json      name + creation time
//! <root>/<sha256(generation)>/<sha256(key)>.json   one CachedEntry each
//! ```
//!
//! Entries are written to a temp file and renamed into place, so readers see
//! either the old or the new entry, never a torn one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use super::{now_millis, CacheStore, CachedEntry, RequestKey};
use crate::{Result, ServiceWorkerError};

const META_FILE: &str = "generation.json";

/// Metadata stored alongside a generation's entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenerationMeta {
    name: String,
    created_at: u64,
}

/// Cache store persisted to a directory.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open_at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            ServiceWorkerError::storage(format!("cannot create {}", root.display()), e)
        })?;
        debug!(root = %root.display(), "DiskStore opened");
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Open the store in the platform cache directory.
    pub async fn open_default() -> Result<Self> {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::open_at(base.join("offkit")).await
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn hashed(value: &str) -> String {
        hex::encode(Sha256::digest(value.as_bytes()))
    }

    fn generation_dir(&self, generation: &str) -> PathBuf {
        self.root.join(Self::hashed(generation))
    }

    fn entry_path(&self, generation: &str, key: &RequestKey) -> PathBuf {
        self.generation_dir(generation)
            .join(format!("{}.json", Self::hashed(&key.to_string())))
    }

    async fn read_meta(dir: &Path) -> Result<Option<GenerationMeta>> {
        let path = dir.join(META_FILE);
        match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).map(Some).map_err(|e| {
                ServiceWorkerError::CacheError(format!("corrupt {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServiceWorkerError::storage(
                format!("cannot read {}", path.display()),
                e,
            )),
        }
    }

    /// Write `bytes` to `path` through a temp file in the same directory.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp-{}-{n}", std::process::id()));
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| ServiceWorkerError::storage(format!("cannot write {}", tmp.display()), e))?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(ServiceWorkerError::storage(
                format!("cannot rename into {}", path.display()),
                e,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn open(&self, generation: &str) -> Result<()> {
        let dir = self.generation_dir(generation);
        if Self::read_meta(&dir).await?.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ServiceWorkerError::storage(format!("cannot create {}", dir.display()), e))?;

        let meta = GenerationMeta {
            name: generation.to_string(),
            created_at: now_millis(),
        };
        let raw = serde_json::to_vec(&meta).map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
        self.write_atomic(&dir.join(META_FILE), &raw).await
    }

    async fn has(&self, generation: &str) -> Result<bool> {
        Ok(Self::read_meta(&self.generation_dir(generation)).await?.is_some())
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut dirs = fs::read_dir(&self.root).await.map_err(|e| {
            ServiceWorkerError::storage(format!("cannot list {}", self.root.display()), e)
        })?;

        let mut metas = Vec::new();
        while let Some(dir) = dirs
            .next_entry()
            .await
            .map_err(|e| ServiceWorkerError::storage("cannot list generations", e))?
        {
            match Self::read_meta(&dir.path()).await {
                Ok(Some(meta)) => metas.push(meta),
                Ok(None) => {}
                Err(e) => warn!(path = %dir.path().display(), error = %e, "Skipping unreadable generation"),
            }
        }

        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(metas.into_iter().map(|m| m.name).collect())
    }

    async fn delete(&self, generation: &str) -> Result<bool> {
        let dir = self.generation_dir(generation);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ServiceWorkerError::storage(
                format!("cannot delete {}", dir.display()),
                e,
            )),
        }
    }

    async fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
        let path = self.entry_path(generation, key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ServiceWorkerError::storage(
                    format!("cannot read {}", path.display()),
                    e,
                ))
            }
        };
        let entry: CachedEntry = serde_json::from_slice(&raw)
            .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt {}: {e}", path.display())))?;
        // Hash collisions are not expected, but never answer for another key.
        Ok((entry.key == *key).then_some(entry))
    }

    async fn put(&self, generation: &str, entry: CachedEntry) -> Result<()> {
        self.open(generation).await?;
        let path = self.entry_path(generation, &entry.key);
        let raw = serde_json::to_vec(&entry).map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
        self.write_atomic(&path, &raw).await
    }

    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>> {
        let dir = self.generation_dir(generation);
        let mut files = match fs::read_dir(&dir).await {
            Ok(files) => files,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ServiceWorkerError::storage(
                    format!("cannot list {}", dir.display()),
                    e,
                ))
            }
        };

        let mut keys = Vec::new();
        while let Some(file) = files
            .next_entry()
            .await
            .map_err(|e| ServiceWorkerError::storage("cannot list entries", e))?
        {
            let path = file.path();
            let is_entry = path.extension().is_some_and(|ext| ext == "json")
                && path.file_name().is_some_and(|name| name != META_FILE);
            if !is_entry {
                continue;
            }
            let raw = fs::read(&path)
                .await
                .map_err(|e| ServiceWorkerError::storage(format!("cannot read {}", path.display()), e))?;
            match serde_json::from_slice::<CachedEntry>(&raw) {
                Ok(entry) => keys.push(entry.key),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping corrupt entry"),
            }
        }
        Ok(keys)
    }

    async fn created_at(&self, generation: &str) -> Result<Option<u64>> {
        Ok(Self::read_meta(&self.generation_dir(generation))
            .await?
            .map(|m| m.created_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn entry(url: &str, body: &[u8]) -> CachedEntry {
        CachedEntry {
            key: RequestKey::get(&Url::parse(url).unwrap()),
            status: 200,
            headers: vec![("content-type".to_string(), "text/css".to_string())],
            body: body.to_vec(),
            cached_at: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let stored = entry("https://example.com/styles.css", b"body{}");

        {
            let store = DiskStore::open_at(dir.path()).await.unwrap();
            store.put("precache-v1", stored.clone()).await.unwrap();
        }

        let store = DiskStore::open_at(dir.path()).await.unwrap();
        assert_eq!(store.names().await.unwrap(), vec!["precache-v1"]);
        let found = store.get("precache-v1", &stored.key).await.unwrap();
        assert_eq!(found, Some(stored));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open_at(dir.path()).await.unwrap();

        store.put("runtime", entry("https://example.com/a.js", b"1")).await.unwrap();
        store.put("runtime", entry("https://example.com/a.js", b"2")).await.unwrap();

        let keys = store.keys("runtime").await.unwrap();
        assert_eq!(keys.len(), 1);
        let found = store.get("runtime", &keys[0]).await.unwrap().unwrap();
        assert_eq!(found.body, b"2");
    }

    #[tokio::test]
    async fn test_generation_names_with_separators() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open_at(dir.path()).await.unwrap();

        store.open("app/../precache v2").await.unwrap();
        assert!(store.has("app/../precache v2").await.unwrap());
        assert_eq!(store.names().await.unwrap(), vec!["app/../precache v2"]);
    }

    #[tokio::test]
    async fn test_delete_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open_at(dir.path()).await.unwrap();

        store.put("old", entry("https://example.com/", b"x")).await.unwrap();
        assert!(store.delete("old").await.unwrap());
        assert!(!store.delete("old").await.unwrap());
        assert!(store.names().await.unwrap().is_empty());
        assert!(store.keys("old").await.unwrap().is_empty());
    }
}
