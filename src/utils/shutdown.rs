use std::time::Duration;

use tokio::{signal, time::timeout};
use tokio_util::sync::CancellationToken;

/// Process-wide shutdown signal. Every long-running task holds a child of
/// [`Shutdown::token`]; cancelling the root stops the server, in-flight
/// chains and the synchronizer together.
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
    grace_period: Duration,
}

impl Shutdown {
    /// Create a new Shutdown with the default 30-second grace period
    pub fn new() -> Self {
        Self::with_grace_period(Duration::from_secs(30))
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace_period,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown triggered");
        }
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM, then cancel the root token.
    pub async fn listen_for_signals(&self) {
        tokio::select! {
            _ = self.token.cancelled() => return,
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }
        self.trigger();
    }

    /// Run `task` to completion, giving up once the grace period has passed.
    /// Returns whether the task finished in time.
    pub async fn drain<F: Future<Output = ()>>(&self, what: &str, task: F) -> bool {
        match timeout(self.grace_period, task).await {
            Ok(()) => true,
            Err(_) => {
                tracing::error!(
                    "{} did not stop within {:?}, abandoning it",
                    what,
                    self.grace_period
                );
                false
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_children() {
        let shutdown = Shutdown::new();
        let child = shutdown.token().child_token();
        assert!(!shutdown.is_triggered());

        shutdown.trigger();
        assert!(shutdown.is_triggered());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_listen_returns_when_triggered_elsewhere() {
        let shutdown = Shutdown::new();
        let listener = shutdown.clone();
        let handle = tokio::spawn(async move { listener.listen_for_signals().await });
        shutdown.trigger();
        assert!(
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_grace_period() {
        let shutdown = Shutdown::with_grace_period(Duration::from_millis(20));
        assert!(shutdown.drain("quick", async {}).await);
        assert!(
            !shutdown
                .drain("stuck", std::future::pending::<()>())
                .await
        );
    }
}
