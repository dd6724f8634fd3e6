//! In-memory cache store.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use super::{now_millis, CacheStore, CachedEntry, RequestKey};
use crate::Result;

/// A generation held in memory.
#[derive(Debug)]
struct Generation {
    created_at: u64,
    /// Creation order; wall-clock time alone ties within a millisecond.
    seq: u64,
    entries: HashMap<RequestKey, CachedEntry>,
}

/// Cache store that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    generations: RwLock<HashMap<String, Generation>>,
    next_seq: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn new_generation(&self) -> Generation {
        Generation {
            created_at: now_millis(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            entries: HashMap::new(),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn open(&self, generation: &str) -> Result<()> {
        let mut generations = self.generations.write().await;
        if !generations.contains_key(generation) {
            generations.insert(generation.to_string(), self.new_generation());
        }
        Ok(())
    }

    async fn has(&self, generation: &str) -> Result<bool> {
        Ok(self.generations.read().await.contains_key(generation))
    }

    async fn names(&self) -> Result<Vec<String>> {
        let generations = self.generations.read().await;
        let mut names: Vec<(&String, u64)> = generations.iter().map(|(n, g)| (n, g.seq)).collect();
        names.sort_by_key(|(_, seq)| *seq);
        Ok(names.into_iter().map(|(n, _)| n.clone()).collect())
    }

    async fn delete(&self, generation: &str) -> Result<bool> {
        Ok(self.generations.write().await.remove(generation).is_some())
    }

    async fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
        Ok(self
            .generations
            .read()
            .await
            .get(generation)
            .and_then(|g| g.entries.get(key))
            .cloned())
    }

    async fn put(&self, generation: &str, entry: CachedEntry) -> Result<()> {
        let mut generations = self.generations.write().await;
        if !generations.contains_key(generation) {
            generations.insert(generation.to_string(), self.new_generation());
        }
        if let Some(g) = generations.get_mut(generation) {
            g.entries.insert(entry.key.clone(), entry);
        }
        Ok(())
    }

    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>> {
        Ok(self
            .generations
            .read()
            .await
            .get(generation)
            .map(|g| g.entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn created_at(&self, generation: &str) -> Result<Option<u64>> {
        Ok(self.generations.read().await.get(generation).map(|g| g.created_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn entry(url: &str, body: &str) -> CachedEntry {
        CachedEntry {
            key: RequestKey::get(&Url::parse(url).unwrap()),
            status: 200,
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
            cached_at: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_open_and_delete() {
        let store = MemoryStore::new();
        assert!(!store.has("v1").await.unwrap());

        store.open("v1").await.unwrap();
        assert!(store.has("v1").await.unwrap());
        assert!(store.created_at("v1").await.unwrap().is_some());

        assert!(store.delete("v1").await.unwrap());
        assert!(!store.delete("v1").await.unwrap());
        assert!(!store.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_names_in_creation_order() {
        let store = MemoryStore::new();
        store.open("b").await.unwrap();
        store.open("a").await.unwrap();
        store.open("c").await.unwrap();
        store.open("b").await.unwrap();

        assert_eq!(store.names().await.unwrap(), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_put_twice_keeps_one_entry() {
        let store = MemoryStore::new();
        store.put("runtime", entry("https://example.com/a.css", "old")).await.unwrap();
        store.put("runtime", entry("https://example.com/a.css", "new")).await.unwrap();

        let keys = store.keys("runtime").await.unwrap();
        assert_eq!(keys.len(), 1);

        let found = store.get("runtime", &keys[0]).await.unwrap().unwrap();
        assert_eq!(found.body, b"new");
    }

    #[tokio::test]
    async fn test_get_from_missing_generation_is_a_miss() {
        let store = MemoryStore::new();
        let key = RequestKey::get(&Url::parse("https://example.com/").unwrap());
        assert!(store.get("nope", &key).await.unwrap().is_none());
        assert!(store.keys("nope").await.unwrap().is_empty());
    }
}
