//! Graceful shutdown coordination via `CancellationToken`.
//!
//! Ingress loops hold a child of the root token and race every blocking read
//! against it. Connection tasks are spawned through the coordinator's
//! tracker so shutdown can wait for them to finish.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default timeout for graceful shutdown before giving up on tasks.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinates graceful shutdown across all server tasks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a clone of the root cancellation token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled with the root, or on its own.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Number of tracked tasks still running.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token and wait up to `timeout` for tracked tasks.
    ///
    /// Returns `true` if every task finished in time.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> bool {
        self.shutdown();
        self.tracker.close();
        info!(
            task_count = self.tracker.len(),
            timeout_secs = timeout.as_secs(),
            "Waiting for tasks to complete"
        );

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                "Shutdown timed out after {timeout:?}, some tasks may still be running"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_propagation() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let child = coord.child_token();
        assert!(!coord.is_shutting_down());

        coord.shutdown();
        coord.shutdown();
        assert!(token.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_cancel_root() {
        let coord = ShutdownCoordinator::new();
        let child = coord.child_token();
        child.cancel();
        assert!(!coord.is_shutting_down());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_awaits_tracked_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.child_token();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        coord.spawn(async move {
            token.cancelled().await;
            let _ = done_tx.send(());
        });

        assert!(coord.graceful_shutdown(Duration::from_secs(1)).await);
        assert!(done_rx.await.is_ok());
        assert_eq!(coord.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_times_out() {
        let coord = ShutdownCoordinator::new();

        // Ignores cancellation.
        coord.spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        assert!(!coord.graceful_shutdown(Duration::from_millis(50)).await);
        assert_eq!(coord.active_tasks(), 1);
    }
}
