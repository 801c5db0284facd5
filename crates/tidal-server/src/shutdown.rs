//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default time to wait for sessions to finish before giving up.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared stop signal for the accept loop and session tasks.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Not yet shutting down.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown and wait up to `timeout` for every tracked task.
    ///
    /// Returns `false` if tasks were still running when the timeout hit.
    pub async fn drain(&self, tasks: &TaskTracker, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();
        let _ = tasks.close();
        info!(
            task_count = tasks.len(),
            timeout_secs = timeout.as_secs_f64(),
            "waiting for sessions to finish"
        );
        if tokio::time::timeout(timeout, tasks.wait()).await.is_err() {
            warn!(remaining = tasks.len(), "shutdown timed out after {timeout:?}, some sessions may still be running");
            return false;
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_not_shutting_down() {
        assert!(!ShutdownCoordinator::new().is_shutting_down());
    }

    #[test]
    fn token_propagation() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.token();
        let t2 = coord.token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn drain_waits_for_tasks() {
        let coord = ShutdownCoordinator::new();
        let tasks = TaskTracker::new();
        let token = coord.token();
        let _ = tasks.spawn(async move { token.cancelled().await });
        assert!(coord.drain(&tasks, Some(Duration::from_secs(5))).await);
        assert!(tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out() {
        let coord = ShutdownCoordinator::new();
        let tasks = TaskTracker::new();
        let _ = tasks.spawn(std::future::pending::<()>());
        assert!(!coord.drain(&tasks, Some(Duration::from_millis(50))).await);
        assert_eq!(tasks.len(), 1);
    }
}
