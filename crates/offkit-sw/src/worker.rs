//! The event dispatcher.
//!
//! [`OfflineWorker`] has one async method per worker event. Awaiting the
//! method is the completion signal the host waits on.

use std::sync::Arc;

use offkit_net::{Request, Transport};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::background::BackgroundTasks;
use crate::clients::{ClientMatchOptions, ClientType, Clients};
use crate::config::EngineConfig;
use crate::events::{EventSink, WorkerEvent};
use crate::executor::{Executor, Served};
use crate::generations::GenerationManager;
use crate::lifecycle::{LifecycleController, WorkerState};
use crate::messaging::{ControlMessage, ReplyPort, VersionReply};
use crate::notifications::{Notification, NotificationCenter};
use crate::store::CacheStore;
use crate::strategy::{route, PassReason};
use crate::sync::{DeferredSubmissions, NoopSubmissions};
use crate::{Result, ServiceWorkerError};

/// Result of a fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the host performs the request itself.
    Passthrough(PassReason),
    /// Intercepted and answered.
    Respond(Served),
}

impl FetchOutcome {
    /// The served response, if the request was intercepted.
    pub fn served(self) -> Option<Served> {
        match self {
            FetchOutcome::Respond(served) => Some(served),
            FetchOutcome::Passthrough(_) => None,
        }
    }
}

/// What a notification click did, with the client ID involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    Focused(String),
    Opened(String),
}

/// Offline engine for one application.
pub struct OfflineWorker {
    config: Arc<EngineConfig>,
    generations: Arc<GenerationManager>,
    lifecycle: LifecycleController,
    executor: Executor,
    clients: Arc<RwLock<Clients>>,
    notifications: RwLock<NotificationCenter>,
    submissions: Arc<dyn DeferredSubmissions>,
    background: Arc<BackgroundTasks>,
    events: EventSink,
}

impl OfflineWorker {
    /// Build an engine over `store` and `transport`.
    ///
    /// Returns the engine and the receiver for its [`WorkerEvent`]s.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CacheStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        config.validate()?;
        let offline_document = config.offline_document_url()?;
        let config = Arc::new(config);

        let (events, rx) = EventSink::channel();
        let generations = Arc::new(GenerationManager::new(
            store,
            config.precache_name.clone(),
            config.runtime_name.clone(),
        ));
        let clients = Arc::new(RwLock::new(Clients::new()));
        let background = Arc::new(BackgroundTasks::new());

        let lifecycle = LifecycleController::new(
            config.clone(),
            generations.clone(),
            transport.clone(),
            clients.clone(),
            events.clone(),
        );
        let executor = Executor::new(
            generations.clone(),
            transport,
            background.clone(),
            events.clone(),
            config.network_timeout(),
            &offline_document,
        );

        let worker = Self {
            config,
            generations,
            lifecycle,
            executor,
            clients,
            notifications: RwLock::new(NotificationCenter::new()),
            submissions: Arc::new(NoopSubmissions),
            background,
            events,
        };
        Ok((worker, rx))
    }

    /// Plug in the subsystem flushed by background sync.
    pub fn with_submissions(mut self, submissions: Arc<dyn DeferredSubmissions>) -> Self {
        self.submissions = submissions;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn generations(&self) -> &GenerationManager {
        &self.generations
    }

    /// Client registry shared with the lifecycle controller.
    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.clients
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.state().await
    }

    pub async fn skip_waiting_requested(&self) -> bool {
        self.lifecycle.skip_waiting_requested().await
    }

    /// A notification currently shown under `tag`.
    pub async fn notification(&self, tag: &str) -> Option<Notification> {
        self.notifications.read().await.get(tag).cloned()
    }

    // ==================== Lifecycle ====================

    /// `install`: precache the app shell.
    pub async fn install(&self) -> Result<()> {
        self.lifecycle.install().await
    }

    /// `activate`: drop stale generations and claim clients.
    pub async fn activate(&self) -> Result<Vec<String>> {
        self.lifecycle.activate().await
    }

    /// Take control again after a restart, from the precache a previous run
    /// left in the store. Returns false when a fresh install is needed.
    pub async fn restore(&self) -> Result<bool> {
        self.lifecycle.resume().await
    }

    // ==================== Fetch ====================

    /// `fetch`: intercept a request or let it pass.
    pub async fn fetch(&self, request: &Request) -> FetchOutcome {
        let strategy = match route(request, &self.config.origin) {
            Ok(strategy) => strategy,
            Err(reason) => {
                debug!(url = %request.url, ?reason, "Passing request through");
                return FetchOutcome::Passthrough(reason);
            }
        };
        if !self.lifecycle.is_controlling().await {
            return FetchOutcome::Passthrough(PassReason::NotControlling);
        }

        FetchOutcome::Respond(self.executor.execute(strategy, request).await)
    }

    // ==================== Messages ====================

    /// `message`: handle a control message from a page.
    ///
    /// `reply` receives the answer to `GET_VERSION`; other messages ignore it.
    pub async fn message(&self, data: serde_json::Value, reply: Option<ReplyPort>) -> Result<()> {
        let message = ControlMessage::parse(data)?;
        debug!(?message, "Control message");

        match message {
            ControlMessage::SkipWaiting => self.lifecycle.skip_waiting().await,
            ControlMessage::ClearCache => {
                let existed = self.generations.clear_runtime().await?;
                info!(generation = %self.generations.runtime_name(), existed, "Runtime cache cleared");
                self.events.emit(WorkerEvent::RuntimeCacheCleared { existed });
            }
            ControlMessage::GetVersion => {
                let Some(port) = reply else {
                    return Err(ServiceWorkerError::InvalidMessage(
                        "GET_VERSION needs a reply port".to_string(),
                    ));
                };
                let version = VersionReply {
                    version: self.generations.precache_name().to_string(),
                };
                let value = serde_json::to_value(version)
                    .map_err(|e| ServiceWorkerError::InvalidMessage(e.to_string()))?;
                if port.send(value).is_err() {
                    debug!("Version reply dropped; port closed");
                }
            }
            ControlMessage::Unknown => debug!("Ignoring unknown control message"),
        }
        Ok(())
    }

    // ==================== Notifications ====================

    /// `push`: show a notification for a payload. Pushes without one show nothing.
    pub async fn push(&self, payload: Option<&str>) -> Option<Notification> {
        let body = payload?;
        let notification = Notification::from_payload(&self.config.notification, body);
        let replaced = self
            .notifications
            .write()
            .await
            .show(notification.clone());

        self.events.emit(WorkerEvent::NotificationShown {
            tag: notification.tag.clone(),
            replaced,
        });
        Some(notification)
    }

    /// `notificationclick`: close the notification, then focus a window
    /// showing the app root or open a new one.
    pub async fn notification_click(&self, tag: &str) -> Result<ClickOutcome> {
        if self.notifications.write().await.close(tag).is_some() {
            self.events.emit(WorkerEvent::NotificationClosed {
                tag: tag.to_string(),
            });
        }

        let root = self.config.root_url()?;
        let mut clients = self.clients.write().await;
        let options = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        };
        let existing = clients
            .match_all(&options)
            .into_iter()
            .find(|c| c.shows(&root))
            .map(|c| c.id.clone());

        match existing {
            Some(id) => {
                let client = clients.focus(&id)?;
                Ok(ClickOutcome::Focused(client.id))
            }
            None => {
                let client = clients.open_window(root);
                Ok(ClickOutcome::Opened(client.id))
            }
        }
    }

    // ==================== Sync ====================

    /// `sync`: flush deferred submissions for the configured tag.
    pub async fn sync(&self, tag: &str) -> Result<()> {
        self.flush_if(tag, &self.config.sync_tag).await
    }

    /// `periodicsync`: same as [`OfflineWorker::sync`] for the periodic tag.
    pub async fn periodic_sync(&self, tag: &str) -> Result<()> {
        self.flush_if(tag, &self.config.periodic_sync_tag).await
    }

    async fn flush_if(&self, tag: &str, expected: &str) -> Result<()> {
        if tag != expected {
            debug!(tag, "Ignoring sync for unknown tag");
            return Ok(());
        }
        self.submissions.flush(tag).await.inspect_err(|e| {
            warn!(tag, error = %e, "Deferred submissions failed to flush");
        })
    }

    /// Wait for every background cache write spawned so far.
    pub async fn settle(&self) {
        self.background.settle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use http::{Method, StatusCode};
    use serde_json::json;
    use tokio::sync::oneshot;
    use url::Url;

    use crate::executor::ResponseSource;
    use crate::store::MemoryStore;
    use crate::strategy::StrategyClass;
    use crate::testing::ScriptedTransport;

    const ORIGIN: &str = "https://app.test/";

    fn build() -> (OfflineWorker, Arc<ScriptedTransport>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond("https://app.test/", 200, "<html>root</html>")
            .respond("https://app.test/index.html", 200, "<html>index</html>")
            .respond("https://app.test/manifest.json", 200, "{}");
        let config = EngineConfig::new(Url::parse(ORIGIN).unwrap());
        let (worker, rx) =
            OfflineWorker::new(config, Arc::new(MemoryStore::new()), transport.clone()).unwrap();
        (worker, transport, rx)
    }

    async fn activated() -> (OfflineWorker, Arc<ScriptedTransport>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (worker, transport, rx) = build();
        worker.install().await.unwrap();
        worker.activate().await.unwrap();
        (worker, transport, rx)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = EngineConfig::new(Url::parse(ORIGIN).unwrap());
        config.runtime_name = config.precache_name.clone();
        let result = OfflineWorker::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedTransport::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fetch_passes_through_before_activation() {
        let (worker, _, _rx) = build();
        let outcome = worker.fetch(&Request::parse_get("https://app.test/app.js").unwrap()).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Passthrough(PassReason::NotControlling)
        ));
    }

    #[tokio::test]
    async fn test_fetch_declines_non_get_and_cross_origin() {
        let (worker, _, _rx) = activated().await;

        let post = Request::new(Method::POST, Url::parse("https://app.test/api/reports").unwrap());
        assert!(matches!(
            worker.fetch(&post).await,
            FetchOutcome::Passthrough(PassReason::NotGet)
        ));

        let foreign = Request::parse_get("https://cdn.other.test/lib.js").unwrap();
        assert!(matches!(
            worker.fetch(&foreign).await,
            FetchOutcome::Passthrough(PassReason::CrossOrigin)
        ));
    }

    #[tokio::test]
    async fn test_fetch_serves_precached_shell_offline() {
        let (worker, transport, _rx) = activated().await;
        transport.set_online(false);

        let served = worker
            .fetch(&Request::parse_get("https://app.test/manifest.json").unwrap())
            .await
            .served()
            .unwrap();
        assert_eq!(served.strategy, StrategyClass::CacheFirst);
        assert_eq!(served.source, ResponseSource::Cache);
        assert_eq!(served.response.text().unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_fetch_api_offline_gets_json_placeholder() {
        let (worker, transport, _rx) = activated().await;
        transport.set_online(false);

        let served = worker
            .fetch(&Request::parse_get("https://app.test/api/reports").unwrap())
            .await
            .served()
            .unwrap();
        assert_eq!(served.source, ResponseSource::Placeholder);
        assert_eq!(served.response.status, StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = served.response.json().unwrap();
        assert_eq!(body, json!({"offline": true, "message": "No connection available"}));
    }

    #[tokio::test]
    async fn test_skip_waiting_message() {
        let (worker, _, mut rx) = build();
        worker.message(json!({"type": "SKIP_WAITING"}), None).await.unwrap();

        assert!(worker.skip_waiting_requested().await);
        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::SkipWaitingRequested)));
    }

    #[tokio::test]
    async fn test_get_version_replies_on_port() {
        let (worker, _, _rx) = build();
        let (port, answer) = oneshot::channel();

        worker
            .message(json!({"type": "GET_VERSION"}), Some(port))
            .await
            .unwrap();

        assert_eq!(answer.await.unwrap(), json!({"version": "offkit-precache-v1"}));
    }

    #[tokio::test]
    async fn test_get_version_without_port() {
        let (worker, _, _rx) = build();
        let result = worker.message(json!({"type": "GET_VERSION"}), None).await;
        assert!(matches!(result, Err(ServiceWorkerError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_clear_cache_message() {
        let (worker, transport, mut rx) = activated().await;
        transport.respond("https://app.test/api/status", 200, "{}");
        worker
            .fetch(&Request::parse_get("https://app.test/api/status").unwrap())
            .await;
        worker.settle().await;
        while rx.try_recv().is_ok() {}

        worker.message(json!({"type": "CLEAR_CACHE"}), None).await.unwrap();

        let runtime = worker.config().runtime_name.clone();
        assert!(!worker.generations().store().has(&runtime).await.unwrap());
        assert!(matches!(
            rx.try_recv(),
            Ok(WorkerEvent::RuntimeCacheCleared { existed: true })
        ));
    }

    #[tokio::test]
    async fn test_unknown_message_is_ignored() {
        let (worker, _, _rx) = build();
        assert!(worker.message(json!({"type": "RELOAD"}), None).await.is_ok());
        assert!(worker.message(json!(42), None).await.is_err());
    }

    #[tokio::test]
    async fn test_push_without_payload_shows_nothing() {
        let (worker, _, mut rx) = build();
        assert!(worker.push(None).await.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_replaces_by_tag() {
        let (worker, _, mut rx) = build();
        worker.push(Some("first")).await.unwrap();
        let second = worker.push(Some("second")).await.unwrap();

        assert_eq!(worker.notification(&second.tag).await.unwrap().body, "second");
        assert!(matches!(
            rx.try_recv(),
            Ok(WorkerEvent::NotificationShown { replaced: false, .. })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(WorkerEvent::NotificationShown { replaced: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_click_opens_window_when_none_shows_root() {
        let (worker, _, _rx) = build();
        let shown = worker.push(Some("new report")).await.unwrap();
        worker
            .clients()
            .write()
            .await
            .attach(Url::parse("https://app.test/reports").unwrap(), ClientType::Window);

        let outcome = worker.notification_click(&shown.tag).await.unwrap();

        let id = match outcome {
            ClickOutcome::Opened(id) => id,
            other => panic!("expected a new window, got {other:?}"),
        };
        let clients = worker.clients().read().await;
        let opened = clients.get(&id).unwrap();
        assert_eq!(opened.url.as_str(), "https://app.test/");
        assert!(opened.focused);
        assert!(worker.notification(&shown.tag).await.is_none());
    }

    #[tokio::test]
    async fn test_click_focuses_existing_root_window() {
        let (worker, _, _rx) = build();
        let root = worker
            .clients()
            .write()
            .await
            .attach(Url::parse("https://app.test/").unwrap(), ClientType::Window);

        let outcome = worker.notification_click("field-report-notification").await.unwrap();

        assert_eq!(outcome, ClickOutcome::Focused(root.id.clone()));
        assert!(worker.clients().read().await.get(&root.id).unwrap().focused);
    }

    #[tokio::test]
    async fn test_click_under_sub_path_focuses_app_window() {
        let app = Url::parse("https://user.github.io/field-report/").unwrap();
        let (worker, _rx) = OfflineWorker::new(
            EngineConfig::new(app.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedTransport::new()),
        )
        .unwrap();
        let window = worker.clients().write().await.attach(app, ClientType::Window);

        let outcome = worker.notification_click("field-report-notification").await.unwrap();
        assert_eq!(outcome, ClickOutcome::Focused(window.id.clone()));

        worker.clients().write().await.remove(&window.id);
        let reopened = worker.notification_click("field-report-notification").await.unwrap();
        let ClickOutcome::Opened(id) = reopened else {
            panic!("expected a new window");
        };
        assert_eq!(
            worker.clients().read().await.get(&id).unwrap().url.as_str(),
            "https://user.github.io/field-report/"
        );
    }

    struct CountingSubmissions(AtomicUsize);

    #[async_trait]
    impl DeferredSubmissions for CountingSubmissions {
        async fn flush(&self, _tag: &str) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sync_flushes_only_configured_tags() {
        let (worker, _, _rx) = build();
        let submissions = Arc::new(CountingSubmissions(AtomicUsize::new(0)));
        let worker = worker.with_submissions(submissions.clone());

        worker.sync("sync-submissions").await.unwrap();
        worker.periodic_sync("sync-field-reports").await.unwrap();
        worker.sync("sync-field-reports").await.unwrap();
        worker.periodic_sync("other").await.unwrap();

        assert_eq!(submissions.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sync_without_subsystem_resolves() {
        let (worker, _, _rx) = build();
        assert!(worker.sync("sync-submissions").await.is_ok());
        assert!(worker.periodic_sync("sync-field-reports").await.is_ok());
    }
}
