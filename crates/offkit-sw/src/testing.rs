//! In-memory doubles for exercising the engine without a network or disk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use http::StatusCode;
use offkit_net::{NetError, Request, Response, Transport};
use url::Url;

use crate::store::{now_millis, CacheStore, CachedEntry, MemoryStore, RequestKey};
use crate::{Result, ServiceWorkerError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum Route {
    Respond {
        status: StatusCode,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    Fail,
}

/// Transport answering from a fixed route table.
///
/// Unknown URLs get a 404. While offline every fetch fails. Every call is
/// recorded, offline or not.
#[derive(Debug)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    online: AtomicBool,
    calls: Mutex<Vec<Url>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer `url` with `status` and `body`.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        self.respond_with_headers(url, status, &[], body)
    }

    /// Answer `url` with `status`, `headers` and `body`.
    pub fn respond_with_headers(
        &self,
        url: &str,
        status: u16,
        headers: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> &Self {
        let route = Route::Respond {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: body.into(),
        };
        lock(&self.routes).insert(url.to_string(), route);
        self
    }

    /// Make fetches of `url` fail as if the network were down.
    pub fn fail(&self, url: &str) -> &Self {
        lock(&self.routes).insert(url.to_string(), Route::Fail);
        self
    }

    /// Toggle the whole network.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// URLs fetched so far.
    pub fn calls(&self) -> Vec<Url> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetError> {
        lock(&self.calls).push(request.url.clone());

        if !self.online.load(Ordering::SeqCst) {
            return Err(NetError::Offline("scripted offline".to_string()));
        }

        let route = lock(&self.routes).get(request.url.as_str()).cloned();
        match route {
            Some(Route::Respond {
                status,
                headers,
                body,
            }) => {
                let mut response = Response::new(request.url.clone(), status).with_body(body);
                for (name, value) in &headers {
                    response = response.with_header(name, value);
                }
                Ok(response)
            }
            Some(Route::Fail) => Err(NetError::Offline(format!("scripted failure for {}", request.url))),
            None => Ok(Response::new(request.url.clone(), StatusCode::NOT_FOUND)),
        }
    }
}

/// [`MemoryStore`] wrapper that fails selected operations.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_puts: AtomicBool,
    fail_lookups: AtomicBool,
    fail_deletes: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped store, for arranging state behind the failures.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes_of(&self, generation: &str) {
        lock(&self.fail_deletes).insert(generation.to_string());
    }

    fn injected(op: &str) -> ServiceWorkerError {
        ServiceWorkerError::CacheError(format!("injected {op} failure"))
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn open(&self, generation: &str) -> Result<()> {
        self.inner.open(generation).await
    }

    async fn has(&self, generation: &str) -> Result<bool> {
        self.inner.has(generation).await
    }

    async fn names(&self) -> Result<Vec<String>> {
        self.inner.names().await
    }

    async fn delete(&self, generation: &str) -> Result<bool> {
        if lock(&self.fail_deletes).contains(generation) {
            return Err(Self::injected("delete"));
        }
        self.inner.delete(generation).await
    }

    async fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(Self::injected("lookup"));
        }
        self.inner.get(generation, key).await
    }

    async fn put(&self, generation: &str, entry: CachedEntry) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Self::injected("put"));
        }
        self.inner.put(generation, entry).await
    }

    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>> {
        self.inner.keys(generation).await
    }

    async fn created_at(&self, generation: &str) -> Result<Option<u64>> {
        self.inner.created_at(generation).await
    }
}

/// A 200 entry for `url` with a text body.
///
/// # Panics
///
/// If `url` is not an absolute URL.
pub fn entry(url: &str, body: &str) -> CachedEntry {
    let url = Url::parse(url).expect("entry() needs an absolute URL");
    CachedEntry {
        key: RequestKey::get(&url),
        status: 200,
        headers: Vec::new(),
        body: body.as_bytes().to_vec(),
        cached_at: now_millis(),
    }
}
