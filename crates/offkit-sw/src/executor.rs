//! Strategy executors.
//!
//! Every path ends in a response: network, cache, or a synthesized
//! placeholder. Storage failures on the way are reported through the
//! [`EventSink`] and otherwise treated as cache misses.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use offkit_common::with_timeout;
use offkit_net::{NetError, Request, Response, Transport};
use tracing::{debug, trace};
use url::Url;

use crate::background::BackgroundTasks;
use crate::events::{EventSink, StorageOperation};
use crate::generations::GenerationManager;
use crate::store::{CachedEntry, RequestKey};
use crate::strategy::StrategyClass;

const OFFLINE_TEXT: &str = "Offline - Resource not available";
const OFFLINE_MESSAGE: &str = "No connection available";

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Synthesized; neither fetched nor cached.
    Placeholder,
}

/// A response handed back to the requester.
#[derive(Debug)]
pub struct Served {
    pub response: Response,
    pub source: ResponseSource,
    pub strategy: StrategyClass,
}

impl Served {
    fn network(response: Response, strategy: StrategyClass) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
            strategy,
        }
    }

    fn cached(entry: &CachedEntry, strategy: StrategyClass) -> Self {
        Self {
            response: entry.to_response(),
            source: ResponseSource::Cache,
            strategy,
        }
    }

    fn placeholder(response: Response, strategy: StrategyClass) -> Self {
        Self {
            response,
            source: ResponseSource::Placeholder,
            strategy,
        }
    }
}

/// 503 with a plain-text body.
pub fn offline_text(url: &Url) -> Response {
    Response::new(url.clone(), StatusCode::SERVICE_UNAVAILABLE)
        .with_content_type(&mime::TEXT_PLAIN_UTF_8)
        .with_body(OFFLINE_TEXT)
}

/// 503 with `{"offline":true,"message":"No connection available"}`.
pub fn offline_json(url: &Url) -> Response {
    let body = serde_json::json!({
        "offline": true,
        "message": OFFLINE_MESSAGE,
    });
    Response::new(url.clone(), StatusCode::SERVICE_UNAVAILABLE)
        .with_content_type(&mime::APPLICATION_JSON)
        .with_body(body.to_string())
}

/// Runs the three fetch strategies over the generations and the network.
pub struct Executor {
    generations: Arc<GenerationManager>,
    transport: Arc<dyn Transport>,
    background: Arc<BackgroundTasks>,
    events: EventSink,
    network_timeout: Duration,
    offline_document: RequestKey,
}

impl Executor {
    pub fn new(
        generations: Arc<GenerationManager>,
        transport: Arc<dyn Transport>,
        background: Arc<BackgroundTasks>,
        events: EventSink,
        network_timeout: Duration,
        offline_document: &Url,
    ) -> Self {
        Self {
            generations,
            transport,
            background,
            events,
            network_timeout,
            offline_document: RequestKey::get(offline_document),
        }
    }

    /// Serve `request` with the given strategy.
    pub async fn execute(&self, strategy: StrategyClass, request: &Request) -> Served {
        match strategy {
            StrategyClass::CacheFirst => self.cache_first(request).await,
            StrategyClass::NetworkFirst => self.network_first(request).await,
            StrategyClass::NetworkFirstWithFallback => self.network_first_with_fallback(request).await,
        }
    }

    /// Cache, then network (cached in the background), then the offline
    /// document for page loads or a text placeholder.
    pub async fn cache_first(&self, request: &Request) -> Served {
        let strategy = StrategyClass::CacheFirst;
        let key = RequestKey::from_request(request);

        if let Some(entry) = self.lookup(&key).await {
            return Served::cached(&entry, strategy);
        }

        match self.network(request).await {
            Ok(response) => {
                self.cache_in_background(key, &response);
                Served::network(response, strategy)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, no cached copy");
                if request.is_document() {
                    if let Some(entry) = self.lookup(&self.offline_document).await {
                        return Served::cached(&entry, strategy);
                    }
                }
                Served::placeholder(offline_text(&request.url), strategy)
            }
        }
    }

    /// Network (200s cached in the background), then cache, then a JSON
    /// offline payload.
    pub async fn network_first(&self, request: &Request) -> Served {
        self.network_then_cache(request, StrategyClass::NetworkFirst, offline_json)
            .await
    }

    /// Network (200s cached in the background), then cache, then a text
    /// placeholder.
    pub async fn network_first_with_fallback(&self, request: &Request) -> Served {
        self.network_then_cache(request, StrategyClass::NetworkFirstWithFallback, offline_text)
            .await
    }

    async fn network_then_cache(
        &self,
        request: &Request,
        strategy: StrategyClass,
        placeholder: fn(&Url) -> Response,
    ) -> Served {
        let key = RequestKey::from_request(request);

        match self.network(request).await {
            Ok(response) => {
                if response.status == StatusCode::OK {
                    self.cache_in_background(key, &response);
                }
                Served::network(response, strategy)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                match self.lookup(&key).await {
                    Some(entry) => Served::cached(&entry, strategy),
                    None => Served::placeholder(placeholder(&request.url), strategy),
                }
            }
        }
    }

    /// Fetch with the engine's timeout. A timeout counts as a network failure.
    async fn network(&self, request: &Request) -> Result<Response, NetError> {
        match with_timeout(self.network_timeout, self.transport.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout(self.network_timeout)),
        }
    }

    async fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
        match self.generations.lookup(key).await {
            Ok(found) => found,
            Err(e) => {
                self.events
                    .storage_failure(StorageOperation::Lookup, None, Some(key), &e);
                None
            }
        }
    }

    /// Write a copy of `response` to the runtime generation without making
    /// the caller wait.
    fn cache_in_background(&self, key: RequestKey, response: &Response) {
        let copy = response.duplicate();
        let generations = Arc::clone(&self.generations);
        let events = self.events.clone();

        self.background.spawn(async move {
            let entry = CachedEntry::from_response(key.clone(), copy);
            match generations.put_runtime(entry).await {
                Ok(()) => trace!(%key, "Cached in runtime generation"),
                Err(e) => events.storage_failure(
                    StorageOperation::BackgroundWrite,
                    Some(generations.runtime_name()),
                    Some(&key),
                    &e,
                ),
            }
        });
    }
}
