//! Engine configuration.
//!
//! Everything the engine needs to know about the application it serves lives
//! here and is handed to [`crate::OfflineWorker::new`]; there is no global
//! state, so several engines can run side by side.

use std::path::Path;
use std::time::Duration;

use offkit_common::OffkitError;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::notifications::NotificationConfig;
use crate::Result;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The application's own origin. Relative asset paths resolve against it.
    pub origin: Url,

    /// Name of the precache generation. Versioned per deployment.
    #[serde(default = "defaults::precache_name")]
    pub precache_name: String,

    /// Name of the runtime generation.
    #[serde(default = "defaults::runtime_name")]
    pub runtime_name: String,

    /// App shell assets fetched at install.
    #[serde(default = "defaults::manifest_assets")]
    pub manifest_assets: Vec<String>,

    /// Document served to page loads when offline and uncached.
    #[serde(default = "defaults::offline_document")]
    pub offline_document: String,

    /// Network fetches slower than this count as offline.
    #[serde(default = "defaults::network_timeout_ms")]
    pub network_timeout_ms: u64,

    /// Fetch attempts per manifest asset during install.
    #[serde(default = "defaults::precache_attempts")]
    pub precache_attempts: u32,

    #[serde(default)]
    pub notification: NotificationConfig,

    /// Tag of the one-off background sync that flushes deferred submissions.
    #[serde(default = "defaults::sync_tag")]
    pub sync_tag: String,

    /// Tag of the periodic background sync.
    #[serde(default = "defaults::periodic_sync_tag")]
    pub periodic_sync_tag: String,
}

mod defaults {
    pub fn precache_name() -> String {
        "offkit-precache-v1".to_string()
    }

    pub fn runtime_name() -> String {
        "offkit-runtime-v1".to_string()
    }

    pub fn manifest_assets() -> Vec<String> {
        vec![
            "./".to_string(),
            "./index.html".to_string(),
            "./manifest.json".to_string(),
        ]
    }

    pub fn offline_document() -> String {
        "./index.html".to_string()
    }

    pub fn network_timeout_ms() -> u64 {
        10_000
    }

    pub fn precache_attempts() -> u32 {
        1
    }

    pub fn sync_tag() -> String {
        "sync-submissions".to_string()
    }

    pub fn periodic_sync_tag() -> String {
        "sync-field-reports".to_string()
    }
}

impl EngineConfig {
    /// Configuration with defaults for the given origin.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            precache_name: defaults::precache_name(),
            runtime_name: defaults::runtime_name(),
            manifest_assets: defaults::manifest_assets(),
            offline_document: defaults::offline_document(),
            network_timeout_ms: defaults::network_timeout_ms(),
            precache_attempts: defaults::precache_attempts(),
            notification: NotificationConfig::default(),
            sync_tag: defaults::sync_tag(),
            periodic_sync_tag: defaults::periodic_sync_tag(),
        }
    }

    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| OffkitError::Config {
            message: "invalid engine config".to_string(),
            source: Some(Box::new(e)),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| OffkitError::Config {
            message: format!("cannot read {}", path.display()),
            source: Some(Box::new(e)),
        })?;
        Self::from_json(&raw)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.precache_name.is_empty() || self.runtime_name.is_empty() {
            return Err(OffkitError::config("generation names must not be empty").into());
        }
        if self.precache_name == self.runtime_name {
            return Err(OffkitError::config(format!(
                "precache and runtime generations share the name {:?}",
                self.precache_name
            ))
            .into());
        }
        if self.origin.cannot_be_a_base() {
            return Err(OffkitError::config(format!("origin {} is not a base URL", self.origin)).into());
        }
        for asset in &self.manifest_assets {
            self.resolve(asset)?;
        }
        self.resolve(&self.offline_document)?;
        Ok(())
    }

    /// Resolve an asset path against the origin.
    pub fn resolve(&self, asset: &str) -> Result<Url> {
        let mut url = self.origin.join(asset).map_err(|e| {
            OffkitError::config(format!("asset {asset:?} does not resolve: {e}"))
        })?;
        url.set_fragment(None);
        Ok(url)
    }

    /// Absolute URLs of the app shell manifest.
    pub fn manifest_urls(&self) -> Result<Vec<Url>> {
        self.manifest_assets.iter().map(|a| self.resolve(a)).collect()
    }

    /// Absolute URL of the offline document.
    pub fn offline_document_url(&self) -> Result<Url> {
        self.resolve(&self.offline_document)
    }

    /// The application's start page: the origin's base path, which may be
    /// below the host root.
    pub fn root_url(&self) -> Result<Url> {
        self.resolve("./")
    }

    /// Network timeout as a [`Duration`].
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}
