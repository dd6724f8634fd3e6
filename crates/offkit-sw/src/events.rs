//! Events the engine reports to its host.

use tokio::sync::mpsc;
use tracing::warn;

use crate::lifecycle::WorkerState;
use crate::store::RequestKey;

/// Storage operation whose failure was swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    /// Detached write of a network response into the runtime generation.
    BackgroundWrite,
    /// Deletion of a generation (activation cleanup or CLEAR_CACHE).
    GenerationDelete,
    /// Enumeration of generations.
    Listing,
    /// Cache lookup on the response path.
    Lookup,
}

/// A storage failure that was kept off the response path.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub operation: StorageOperation,
    pub generation: Option<String>,
    pub key: Option<RequestKey>,
    pub message: String,
}

/// Engine events.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Lifecycle state changed.
    StateChange { state: WorkerState },
    /// The worker asked to activate without waiting for old clients.
    SkipWaitingRequested,
    /// A client is now controlled by this worker.
    ControllerChange { client_id: String },
    /// A notification was shown; `replaced` if it displaced one with the same tag.
    NotificationShown { tag: String, replaced: bool },
    /// A notification was closed.
    NotificationClosed { tag: String },
    /// The runtime generation was deleted by a control message.
    RuntimeCacheCleared { existed: bool },
    /// A swallowed storage failure.
    Diagnostic(Diagnostic),
}

/// Sending half of the event channel. Cheap to clone into background tasks.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the host drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. A dropped receiver is not an error.
    pub fn emit(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    /// Log and emit a swallowed storage failure.
    pub fn storage_failure(
        &self,
        operation: StorageOperation,
        generation: Option<&str>,
        key: Option<&RequestKey>,
        error: &dyn std::fmt::Display,
    ) {
        warn!(
            ?operation,
            generation = generation.unwrap_or("-"),
            key = %key.map(ToString::to_string).unwrap_or_default(),
            error = %error,
            "Storage operation failed"
        );
        self.emit(WorkerEvent::Diagnostic(Diagnostic {
            operation,
            generation: generation.map(str::to_string),
            key: key.cloned(),
            message: error.to_string(),
        }));
    }
}
