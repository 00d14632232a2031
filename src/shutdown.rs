//! Process shutdown coordination for the daemon: waits for a termination signal, then
//! cancels and joins every registered background task within a bounded time.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_GRACE: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
            grace,
        }
    }

    /// Get a clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Register a task handle for shutdown coordination
    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Resolve on Ctrl-C, SIGTERM, or when the token is cancelled from inside the process
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
            }
            _ = terminate => {}
            _ = self.cancel_token.cancelled() => return,
        }
        tracing::info!("🛑 Shutdown signal received");
    }

    /// Cancel the token and wait for registered tasks, giving up after the grace period
    pub async fn shutdown(mut self) -> bool {
        self.cancel_token.cancel();

        let shutdown_tasks = std::pin::pin!(async {
            for handle in self.task_handles.drain(..) {
                let _ = handle.await;
            }
        });

        match tokio::time::timeout(self.grace, shutdown_tasks).await {
            Ok(_) => {
                tracing::info!("✓ All tasks shut down gracefully");
                true
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete");
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registered_tasks_observe_cancellation() {
        let mut manager = ShutdownManager::with_grace(Duration::from_secs(2));
        let token = manager.token();
        manager.register_task(tokio::spawn(async move {
            token.cancelled().await;
        }));
        assert!(manager.shutdown().await);
    }

    #[tokio::test]
    async fn test_stuck_task_hits_grace_period() {
        let mut manager = ShutdownManager::with_grace(Duration::from_millis(50));
        manager.register_task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }));
        assert!(!manager.shutdown().await);
    }

    #[tokio::test]
    async fn test_internal_cancel_ends_wait() {
        let manager = ShutdownManager::new();
        manager.token().cancel();
        tokio::time::timeout(Duration::from_secs(1), manager.wait_for_signal())
            .await
            .unwrap();
    }
}
