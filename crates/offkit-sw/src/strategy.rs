//! Request classification.

use http::Method;
use offkit_net::Request;
use serde::Serialize;
use url::Url;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StrategyClass {
    /// Cache, then network. Static assets.
    CacheFirst,
    /// Network, then cache, then a JSON offline payload. API calls.
    NetworkFirst,
    /// Network, then cache, then a plain-text offline body. Everything else.
    NetworkFirstWithFallback,
}

/// Why a request is left to default network handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    /// Only GET requests are intercepted.
    NotGet,
    /// The request targets another origin.
    CrossOrigin,
    /// The worker has not activated yet.
    NotControlling,
}

/// A path pattern.
#[derive(Debug, Clone, Copy)]
enum PathPattern {
    Contains(&'static str),
    Suffix(&'static str),
}

impl PathPattern {
    fn matches(self, path: &str) -> bool {
        match self {
            PathPattern::Contains(s) => path.contains(s),
            PathPattern::Suffix(s) => path.ends_with(s),
        }
    }
}

const API_PATTERN: PathPattern = PathPattern::Contains("/api/");

const STATIC_ASSET_PATTERNS: [PathPattern; 7] = [
    PathPattern::Suffix(".css"),
    PathPattern::Suffix(".js"),
    PathPattern::Suffix(".woff"),
    PathPattern::Suffix(".woff2"),
    PathPattern::Suffix(".ttf"),
    PathPattern::Suffix(".eot"),
    PathPattern::Suffix("manifest.json"),
];

/// Pick the strategy for a URL path.
pub fn classify(path: &str) -> StrategyClass {
    if API_PATTERN.matches(path) {
        StrategyClass::NetworkFirst
    } else if STATIC_ASSET_PATTERNS.iter().any(|p| p.matches(path)) {
        StrategyClass::CacheFirst
    } else {
        StrategyClass::NetworkFirstWithFallback
    }
}

/// Decide whether the engine serves `request` and with which strategy.
pub fn route(request: &Request, origin: &Url) -> Result<StrategyClass, PassReason> {
    if request.method != Method::GET {
        return Err(PassReason::NotGet);
    }
    if request.url.origin() != origin.origin() {
        return Err(PassReason::CrossOrigin);
    }
    Ok(classify(request.url.path()))
}
