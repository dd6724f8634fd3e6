//! # Offkit Net
//!
//! Request/response model and network transport for the offkit cache engine.
//!
//! ## Design Goals
//!
//! 1. **Owned responses**: a [`Response`] body is consumed once; callers that
//!    need to both return and persist a response take a [`Response::duplicate`]
//!    first.
//! 2. **Pluggable transport**: the engine only sees the [`Transport`] trait, so
//!    tests and embedders can swap the network out.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod transport;

pub use transport::{HttpTransport, LoaderConfig, Transport};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unavailable: {0}")]
    Offline(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// A full page navigation.
    Document,
    Script,
    Style,
    Font,
    Image,
    Manifest,
    /// `fetch()`/XHR style requests with no particular destination.
    #[default]
    Empty,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub destination: Destination,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            headers: HeaderMap::new(),
            destination: Destination::Empty,
            timeout: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Parse `url` and create a GET request.
    pub fn parse_get(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this request loads a full page.
    pub fn is_document(&self) -> bool {
        self.destination == Destination::Document
    }
}

/// HTTP response.
///
/// Deliberately not `Clone`: the body is handed out once through
/// [`Response::bytes`]. Use [`Response::duplicate`] to materialize a second
/// owned copy.
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Create a response with an empty body.
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a header. Invalid names or values are skipped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.headers.append(n, v);
        }
        self
    }

    /// Set the Content-Type header.
    pub fn with_content_type(mut self, content_type: &Mime) -> Self {
        if let Ok(v) = HeaderValue::try_from(content_type.as_ref()) {
            self.headers.insert(http::header::CONTENT_TYPE, v);
        }
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Borrow the body without consuming the response.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Materialize a second owned copy of this response.
    pub fn duplicate(&self) -> Self {
        Self {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    /// Consume the response, returning the body.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Consume the response, returning the body as text.
    pub fn text(self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Consume the response, decoding the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}
