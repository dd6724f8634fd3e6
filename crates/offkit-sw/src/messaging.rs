//! Page-to-worker control messages.
//!
//! Messages are JSON objects tagged by `type`:
//!
//! ```json
//! {"type": "SKIP_WAITING"}
//! {"type": "CLEAR_CACHE"}
//! {"type": "GET_VERSION"}
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{Result, ServiceWorkerError};

/// Channel a page hands over to receive a reply.
pub type ReplyPort = oneshot::Sender<serde_json::Value>;

/// A control message from a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate without waiting for old clients to close.
    SkipWaiting,
    /// Delete the runtime generation.
    ClearCache,
    /// Reply with the precache generation name.
    GetVersion,
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Parse a message. Objects with an unrecognised `type` become
    /// [`ControlMessage::Unknown`]; anything without a `type` is rejected.
    pub fn parse(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| ServiceWorkerError::InvalidMessage(e.to_string()))
    }
}

/// Reply to [`ControlMessage::GetVersion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: String,
}
