//! Detached tasks that run off the response path.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tracing::trace;

/// Tracks fire-and-forget work such as opportunistic cache writes.
///
/// Tasks report their own failures; nothing is returned to the spawner.
/// Dropping the tracker aborts whatever is still running.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a task on the current runtime.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wait for every task spawned so far.
    pub async fn settle(&self) {
        let mut tasks = std::mem::take(&mut *self.lock());
        let mut finished = 0usize;
        while tasks.join_next().await.is_some() {
            finished += 1;
        }
        trace!(finished, "Background tasks settled");
    }
}
