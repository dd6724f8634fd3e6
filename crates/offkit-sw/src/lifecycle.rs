//! Install and activation.

use std::sync::Arc;

use futures::future::try_join_all;
use hashbrown::HashSet;
use offkit_common::{retry_with_backoff, with_timeout, RetryConfig};
use offkit_net::{NetError, Request, Response, Transport};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::Clients;
use crate::config::EngineConfig;
use crate::events::{EventSink, WorkerEvent};
use crate::generations::GenerationManager;
use crate::store::{CachedEntry, RequestKey};
use crate::{Result, ServiceWorkerError};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Constructed, install not yet run.
    #[default]
    Parsed,
    /// Precaching the app shell.
    Installing,
    /// Installed; waiting for activation.
    Installed,
    /// Cleaning up stale generations.
    Activating,
    /// Active and controlling clients.
    Activated,
    /// Install failed; a later install may retry.
    Redundant,
}

#[derive(Debug)]
struct Registration {
    state: WorkerState,
    skip_waiting: bool,
}

impl Registration {
    fn new() -> Self {
        Self {
            state: WorkerState::Parsed,
            skip_waiting: false,
        }
    }
}

/// Runs install and activate, and tracks the worker state between them.
pub struct LifecycleController {
    config: Arc<EngineConfig>,
    generations: Arc<GenerationManager>,
    transport: Arc<dyn Transport>,
    clients: Arc<RwLock<Clients>>,
    events: EventSink,
    registration: RwLock<Registration>,
}

impl LifecycleController {
    pub fn new(
        config: Arc<EngineConfig>,
        generations: Arc<GenerationManager>,
        transport: Arc<dyn Transport>,
        clients: Arc<RwLock<Clients>>,
        events: EventSink,
    ) -> Self {
        Self {
            config,
            generations,
            transport,
            clients,
            events,
            registration: RwLock::new(Registration::new()),
        }
    }

    pub async fn state(&self) -> WorkerState {
        self.registration.read().await.state
    }

    /// Whether fetches are being intercepted.
    pub async fn is_controlling(&self) -> bool {
        self.state().await == WorkerState::Activated
    }

    pub async fn skip_waiting_requested(&self) -> bool {
        self.registration.read().await.skip_waiting
    }

    async fn set_state(&self, state: WorkerState) {
        self.registration.write().await.state = state;
        debug!(?state, "Worker state changed");
        self.events.emit(WorkerEvent::StateChange { state });
    }

    /// Ask the host to activate without waiting for old clients to close.
    pub async fn skip_waiting(&self) {
        self.registration.write().await.skip_waiting = true;
        self.events.emit(WorkerEvent::SkipWaitingRequested);
    }

    /// Precache the app shell.
    ///
    /// All or nothing: every asset is fetched before anything is written,
    /// and any failure marks the worker redundant and is returned so the host
    /// can retry the install later.
    pub async fn install(&self) -> Result<()> {
        {
            let mut registration = self.registration.write().await;
            match registration.state {
                WorkerState::Parsed | WorkerState::Redundant => {
                    registration.state = WorkerState::Installing;
                }
                other => {
                    return Err(ServiceWorkerError::StateError(format!(
                        "cannot install from {other:?}"
                    )))
                }
            }
        }
        self.events.emit(WorkerEvent::StateChange {
            state: WorkerState::Installing,
        });
        info!(generation = %self.generations.precache_name(), "Installing");

        match self.precache().await {
            Ok(()) => {
                self.set_state(WorkerState::Installed).await;
                self.skip_waiting().await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Install failed");
                self.set_state(WorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<()> {
        let urls = self.config.manifest_urls()?;
        let retry = RetryConfig::attempts(self.config.precache_attempts);

        let fetches = urls.into_iter().map(|url| {
            let retry = &retry;
            async move {
                let response = retry_with_backoff(retry, url.as_str(), || self.fetch_asset(&url))
                    .await
                    .map_err(|e| ServiceWorkerError::PrecacheFailed {
                        asset: url.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok::<_, ServiceWorkerError>(CachedEntry::from_response(RequestKey::get(&url), response))
            }
        });
        let entries = try_join_all(fetches).await?;

        self.generations.populate_precache(entries).await
    }

    /// Fetch one manifest asset. Non-2xx statuses count as failures.
    async fn fetch_asset(&self, url: &Url) -> std::result::Result<Response, NetError> {
        let request = Request::get(url.clone());
        let timeout = self.config.network_timeout();
        let response = with_timeout(timeout, self.transport.fetch(&request))
            .await
            .map_err(|_| NetError::Timeout(timeout))??;
        if !response.ok() {
            return Err(NetError::RequestFailed(format!(
                "{} answered {}",
                url, response.status
            )));
        }
        Ok(response)
    }

    /// Drop stale generations and claim every open client.
    ///
    /// Returns the deleted generation names.
    pub async fn activate(&self) -> Result<Vec<String>> {
        {
            let mut registration = self.registration.write().await;
            if registration.state != WorkerState::Installed {
                return Err(ServiceWorkerError::StateError(format!(
                    "cannot activate from {:?}",
                    registration.state
                )));
            }
            registration.state = WorkerState::Activating;
        }
        self.events.emit(WorkerEvent::StateChange {
            state: WorkerState::Activating,
        });

        let deleted = self.take_control().await;
        info!(deleted = deleted.len(), "Activated");
        Ok(deleted)
    }

    /// Pick up where a previous run left off.
    ///
    /// If the store already holds the configured precache with every manifest
    /// asset in it, the worker activates straight away without touching the
    /// network. Returns false, leaving the state alone, when install is still
    /// needed.
    pub async fn resume(&self) -> Result<bool> {
        let state = self.state().await;
        if !matches!(state, WorkerState::Parsed | WorkerState::Redundant) {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot resume from {state:?}"
            )));
        }
        if !self.precache_complete().await? {
            debug!(generation = %self.generations.precache_name(), "No complete precache to resume from");
            return Ok(false);
        }

        self.set_state(WorkerState::Activating).await;
        let deleted = self.take_control().await;
        info!(deleted = deleted.len(), "Resumed from stored precache");
        Ok(true)
    }

    async fn precache_complete(&self) -> Result<bool> {
        let store = self.generations.store();
        let precache = self.generations.precache_name();
        if !store.has(precache).await? {
            return Ok(false);
        }

        let stored: HashSet<RequestKey> = store.keys(precache).await?.into_iter().collect();
        Ok(self
            .config
            .manifest_urls()?
            .iter()
            .all(|url| stored.contains(&RequestKey::get(url))))
    }

    /// Drop stale generations, claim clients and enter `Activated`.
    async fn take_control(&self) -> Vec<String> {
        let deleted = self.generations.collect_stale(&self.events).await;

        let claimed = self.clients.write().await.claim();
        for client_id in claimed {
            self.events.emit(WorkerEvent::ControllerChange { client_id });
        }

        self.set_state(WorkerState::Activated).await;
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientType;
    use crate::store::{CacheStore, MemoryStore};
    use crate::testing::{entry, ScriptedTransport};

    const ORIGIN: &str = "https://app.test/";

    struct Harness {
        lifecycle: LifecycleController,
        store: Arc<MemoryStore>,
        transport: Arc<ScriptedTransport>,
        clients: Arc<RwLock<Clients>>,
        events: tokio::sync::mpsc::UnboundedReceiver<WorkerEvent>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let clients = Arc::new(RwLock::new(Clients::new()));
        let (sink, events) = EventSink::channel();
        let generations = Arc::new(GenerationManager::new(
            store.clone(),
            config.precache_name.clone(),
            config.runtime_name.clone(),
        ));
        let lifecycle = LifecycleController::new(
            Arc::new(config),
            generations,
            transport.clone(),
            clients.clone(),
            sink,
        );
        Harness {
            lifecycle,
            store,
            transport,
            clients,
            events,
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::new(Url::parse(ORIGIN).unwrap());
        config.precache_name = "precache-v2".to_string();
        config.runtime_name = "runtime".to_string();
        config
    }

    fn serve_shell(transport: &ScriptedTransport) {
        transport
            .respond("https://app.test/", 200, "<html>root</html>")
            .respond("https://app.test/index.html", 200, "<html>index</html>")
            .respond("https://app.test/manifest.json", 200, "{}");
    }

    #[tokio::test]
    async fn test_install_precaches_manifest() {
        let h = harness(config());
        serve_shell(&h.transport);

        h.lifecycle.install().await.unwrap();

        assert_eq!(h.lifecycle.state().await, WorkerState::Installed);
        assert!(h.lifecycle.skip_waiting_requested().await);
        let keys = h.store.keys("precache-v2").await.unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_install_is_all_or_nothing() {
        let h = harness(config());
        serve_shell(&h.transport);
        h.transport.fail("https://app.test/manifest.json");

        let err = h.lifecycle.install().await.unwrap_err();

        match err {
            ServiceWorkerError::PrecacheFailed { asset, .. } => {
                assert_eq!(asset, "https://app.test/manifest.json")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.lifecycle.state().await, WorkerState::Redundant);
        assert!(!h.store.has("precache-v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_install_rejects_error_status() {
        let h = harness(config());
        serve_shell(&h.transport);
        h.transport.respond("https://app.test/index.html", 500, "down");

        assert!(h.lifecycle.install().await.is_err());
        assert!(!h.store.has("precache-v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_install_can_be_retried_after_failure() {
        let h = harness(config());
        h.transport.set_online(false);
        assert!(h.lifecycle.install().await.is_err());

        h.transport.set_online(true);
        serve_shell(&h.transport);
        h.lifecycle.install().await.unwrap();
        assert_eq!(h.lifecycle.state().await, WorkerState::Installed);
    }

    #[tokio::test]
    async fn test_install_retries_per_asset() {
        let mut config = config();
        config.manifest_assets = vec!["./index.html".to_string()];
        config.precache_attempts = 3;
        let h = harness(config);
        h.transport.fail("https://app.test/index.html");

        assert!(h.lifecycle.install().await.is_err());
        assert_eq!(h.transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let h = harness(config());
        assert!(matches!(
            h.lifecycle.activate().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_collects_stale_and_claims() {
        let mut h = harness(config());
        serve_shell(&h.transport);
        h.store.open("precache-v1").await.unwrap();
        h.store.open("runtime").await.unwrap();
        let page = h
            .clients
            .write()
            .await
            .attach(Url::parse(ORIGIN).unwrap(), ClientType::Window);

        h.lifecycle.install().await.unwrap();
        let deleted = h.lifecycle.activate().await.unwrap();

        assert_eq!(deleted, vec!["precache-v1"]);
        let mut names = h.store.names().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["precache-v2", "runtime"]);
        assert!(h.lifecycle.is_controlling().await);
        assert!(h.clients.read().await.get(&page.id).unwrap().controlled);

        let mut saw_controller_change = false;
        while let Ok(event) = h.events.try_recv() {
            if let WorkerEvent::ControllerChange { client_id } = event {
                assert_eq!(client_id, page.id);
                saw_controller_change = true;
            }
        }
        assert!(saw_controller_change);
    }

    #[tokio::test]
    async fn test_resume_activates_from_complete_precache() {
        let config = config();
        let shell = config.manifest_urls().unwrap();
        let h = harness(config);
        for url in &shell {
            h.store.put("precache-v2", entry(url.as_str(), "shell")).await.unwrap();
        }
        h.store.open("precache-v1").await.unwrap();
        h.transport.set_online(false);

        assert!(h.lifecycle.resume().await.unwrap());
        assert!(h.lifecycle.is_controlling().await);
        assert!(!h.store.has("precache-v1").await.unwrap());
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_needs_every_manifest_asset() {
        let h = harness(config());
        h.store
            .put("precache-v2", entry("https://app.test/index.html", "index"))
            .await
            .unwrap();

        assert!(!h.lifecycle.resume().await.unwrap());
        assert_eq!(h.lifecycle.state().await, WorkerState::Parsed);
        assert!(!h.lifecycle.is_controlling().await);
    }

    #[tokio::test]
    async fn test_resume_ignores_other_generations() {
        let h = harness(config());
        for url in ["https://app.test/", "https://app.test/index.html", "https://app.test/manifest.json"] {
            h.store.put("precache-v1", entry(url, "old")).await.unwrap();
        }

        assert!(!h.lifecycle.resume().await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_after_activation_is_rejected() {
        let h = harness(config());
        serve_shell(&h.transport);
        h.lifecycle.install().await.unwrap();
        h.lifecycle.activate().await.unwrap();

        assert!(matches!(
            h.lifecycle.resume().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }
}
