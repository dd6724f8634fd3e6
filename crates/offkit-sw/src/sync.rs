//! Background sync hooks.

use async_trait::async_trait;
use tracing::debug;

use crate::Result;

/// Subsystem that replays work queued while offline.
///
/// Called for the configured sync and periodic-sync tags. Returning an error
/// fails the sync event so the host can reschedule it.
#[async_trait]
pub trait DeferredSubmissions: Send + Sync {
    async fn flush(&self, tag: &str) -> Result<()>;
}

/// Resolves every flush immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSubmissions;

#[async_trait]
impl DeferredSubmissions for NoopSubmissions {
    async fn flush(&self, tag: &str) -> Result<()> {
        debug!(tag, "No deferred submissions to flush");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_resolves() {
        assert!(NoopSubmissions.flush("sync-submissions").await.is_ok());
        assert!(NoopSubmissions.flush("anything").await.is_ok());
    }
}
