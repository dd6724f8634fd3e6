//! # Offkit Service Worker
//!
//! Offline request interception and cache tiering.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache the app shell), activate (drop stale
//!   generations, claim clients)
//! - **Cache generations**: a fixed precache and an opportunistic runtime cache
//!   over a pluggable [`CacheStore`]
//! - **Fetch strategies**: cache-first for static assets, network-first for API
//!   calls, network-first with a plain-text fallback for everything else
//! - **Collaborators**: push notifications, notification clicks, control
//!   messages, background sync hooks
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker (one method per event)
//!     ├── LifecycleController ── install / activate
//!     ├── classify() ─────────── StrategyClass
//!     ├── Executor ───────────── CacheFirst / NetworkFirst / NetworkFirstWithFallback
//!     │       ├── Transport (network)
//!     │       └── BackgroundTasks (detached cache writes)
//!     └── GenerationManager
//!             └── CacheStore (MemoryStore | DiskStore)
//!                     └── generation → RequestKey → CachedEntry
//! ```

use offkit_common::OffkitError;
use offkit_net::NetError;
use thiserror::Error;

pub mod background;
pub mod clients;
pub mod config;
pub mod events;
pub mod executor;
pub mod generations;
pub mod lifecycle;
pub mod messaging;
pub mod notifications;
pub mod store;
pub mod strategy;
pub mod sync;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

pub use background::BackgroundTasks;
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use config::EngineConfig;
pub use events::{Diagnostic, EventSink, StorageOperation, WorkerEvent};
pub use executor::{Executor, ResponseSource, Served};
pub use generations::GenerationManager;
pub use lifecycle::{LifecycleController, WorkerState};
pub use messaging::{ControlMessage, ReplyPort, VersionReply};
pub use notifications::{Notification, NotificationCenter, NotificationConfig};
pub use store::{CacheStore, CachedEntry, DiskStore, MemoryStore, RequestKey};
pub use strategy::{classify, route, PassReason, StrategyClass};
pub use sync::{DeferredSubmissions, NoopSubmissions};
pub use worker::{ClickOutcome, FetchOutcome, OfflineWorker};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Precache of {asset} failed: {reason}")]
    PrecacheFailed { asset: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Common(#[from] OffkitError),
}

impl ServiceWorkerError {
    /// Wrap an I/O failure from a storage backend.
    pub(crate) fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Common(OffkitError::storage_with_source(context, source))
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
