//! Cache storage: named generations of request/response pairs.

use std::fmt;

use async_trait::async_trait;
use http::{HeaderName, HeaderValue, StatusCode};
use offkit_net::{Request, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Result;

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Normalized (method, absolute URL) pair. Fragments are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    method: String,
    url: Url,
}

impl RequestKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: http::Method::GET.to_string(),
            url,
        }
    }

    /// Key for an intercepted request.
    pub fn from_request(request: &Request) -> Self {
        let mut key = Self::get(&request.url);
        key.method = request.method.to_string();
        key
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    /// The request this entry answers.
    pub key: RequestKey,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, repeated names allowed.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Write time (ms since epoch).
    pub cached_at: u64,
}

impl CachedEntry {
    /// Capture a response for storage, consuming it.
    pub fn from_response(key: RequestKey, response: Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            key,
            status: response.status.as_u16(),
            headers,
            body: response.bytes().to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response from this entry.
    pub fn to_response(&self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Response::new(self.key.url.clone(), status).with_body(self.body.clone());
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                response.headers.append(n, v);
            }
        }
        response
    }
}

/// Persistent key-value storage partitioned into named generations.
///
/// Implementations must tolerate concurrent callers; two `put`s of the same
/// key resolve as last write wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create the generation if it does not exist.
    async fn open(&self, generation: &str) -> Result<()>;

    /// Whether the generation exists.
    async fn has(&self, generation: &str) -> Result<bool>;

    /// All generation names, oldest first.
    async fn names(&self) -> Result<Vec<String>>;

    /// Delete a generation with all its entries. Returns whether it existed.
    async fn delete(&self, generation: &str) -> Result<bool>;

    /// Look up a key. A missing generation is a miss.
    async fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

    /// Store an entry under its key, opening the generation if needed.
    async fn put(&self, generation: &str, entry: CachedEntry) -> Result<()>;

    /// Keys stored in a generation.
    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>>;

    /// Creation time (ms since epoch) of a generation.
    async fn created_at(&self, generation: &str) -> Result<Option<u64>>;
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_drops_fragment() {
        let a = RequestKey::get(&Url::parse("https://example.com/page#top").unwrap());
        let b = RequestKey::get(&Url::parse("https://example.com/page").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://example.com/page");
    }

    #[test]
    fn test_key_keeps_query() {
        let a = RequestKey::get(&Url::parse("https://example.com/api/items?page=1").unwrap());
        let b = RequestKey::get(&Url::parse("https://example.com/api/items?page=2").unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_entry_restores_response() {
        let url = Url::parse("https://example.com/app.js").unwrap();
        let response = Response::new(url.clone(), StatusCode::OK)
            .with_header("content-type", "text/javascript")
            .with_header("set-cookie", "a=1")
            .with_header("set-cookie", "b=2")
            .with_body("let x = 1;");

        let entry = CachedEntry::from_response(RequestKey::get(&url), response);
        assert_eq!(entry.status, 200);
        assert_eq!(entry.headers.len(), 3);
        assert!(entry.cached_at > 0);

        let restored = entry.to_response();
        assert_eq!(restored.status, StatusCode::OK);
        assert_eq!(restored.headers.get_all("set-cookie").iter().count(), 2);
        assert_eq!(restored.text().unwrap(), "let x = 1;");
    }

    #[test]
    fn test_entry_json_encodes_body_as_base64() {
        let url = Url::parse("https://example.com/font.woff2").unwrap();
        let entry = CachedEntry {
            key: RequestKey::get(&url),
            status: 200,
            headers: Vec::new(),
            body: vec![0, 159, 146, 150],
            cached_at: 1,
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["body"], "AJ+Slg==");

        let back: CachedEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
