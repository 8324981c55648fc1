//! Background task bookkeeping.

use std::future::Future;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// A set of spawned tasks that can be joined as a group.
#[derive(Debug, Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task and keep its handle. Finished handles are pruned.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of tasks not yet finished.
    pub fn running(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for every task, including ones spawned while waiting.
    pub async fn join_all(&self) {
        loop {
            let batch = {
                let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *handles)
            };
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        warn!(error = %e, "Background task panicked");
                    }
                }
            }
        }
    }
}

/// Resolve once `rx` reads `true`. A dropped sender counts as shutdown.
pub async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
