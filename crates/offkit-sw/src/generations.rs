//! Current vs. stale cache generations.

use std::sync::Arc;

use tracing::{debug, info};

use crate::events::{EventSink, StorageOperation};
use crate::store::{CacheStore, CachedEntry, RequestKey};
use crate::Result;

/// Owns the two current generation names and every write into them.
///
/// The precache is only written by [`GenerationManager::populate_precache`];
/// live traffic can only add to the runtime generation.
pub struct GenerationManager {
    store: Arc<dyn CacheStore>,
    precache: String,
    runtime: String,
}

impl GenerationManager {
    pub fn new(store: Arc<dyn CacheStore>, precache: impl Into<String>, runtime: impl Into<String>) -> Self {
        Self {
            store,
            precache: precache.into(),
            runtime: runtime.into(),
        }
    }

    pub fn precache_name(&self) -> &str {
        &self.precache
    }

    pub fn runtime_name(&self) -> &str {
        &self.runtime
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Whether `name` is one of the two current generations.
    pub fn is_current(&self, name: &str) -> bool {
        name == self.precache || name == self.runtime
    }

    /// Find a key in the current generations, precache first.
    pub async fn lookup(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
        for generation in [&self.precache, &self.runtime] {
            if let Some(entry) = self.store.get(generation, key).await? {
                debug!(%key, generation = %generation, "Cache hit");
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Store a network response in the runtime generation.
    pub async fn put_runtime(&self, entry: CachedEntry) -> Result<()> {
        self.store.put(&self.runtime, entry).await
    }

    /// Write the install-time entries into the precache.
    ///
    /// If any write fails the precache generation is removed again so that no
    /// partial install is ever served.
    pub async fn populate_precache(&self, entries: Vec<CachedEntry>) -> Result<()> {
        self.store.open(&self.precache).await?;
        let count = entries.len();

        for entry in entries {
            if let Err(e) = self.store.put(&self.precache, entry).await {
                if let Err(cleanup) = self.store.delete(&self.precache).await {
                    debug!(error = %cleanup, "Could not remove partial precache");
                }
                return Err(e);
            }
        }

        info!(generation = %self.precache, count, "Precache populated");
        Ok(())
    }

    /// Delete every generation that is not current.
    ///
    /// Best effort: failures are reported to `events` and skipped. Returns
    /// the generations actually deleted.
    pub async fn collect_stale(&self, events: &EventSink) -> Vec<String> {
        let names = match self.store.names().await {
            Ok(names) => names,
            Err(e) => {
                events.storage_failure(StorageOperation::Listing, None, None, &e);
                return Vec::new();
            }
        };

        let mut deleted = Vec::new();
        for name in names.into_iter().filter(|n| !self.is_current(n)) {
            match self.store.delete(&name).await {
                Ok(true) => {
                    info!(generation = %name, "Deleted stale generation");
                    deleted.push(name);
                }
                Ok(false) => {}
                Err(e) => {
                    events.storage_failure(StorageOperation::GenerationDelete, Some(&name), None, &e)
                }
            }
        }
        deleted
    }

    /// Drop the runtime generation. Returns whether it existed.
    pub async fn clear_runtime(&self) -> Result<bool> {
        self.store.delete(&self.runtime).await
    }
}
