//! Process-wide stop signal.
//!
//! `ShutdownArbiter` owns the root cancellation token. Every long-lived task
//! receives the token (or a child of it) and observes it at its suspension
//! points. The composition root wires SIGINT/SIGTERM to `trigger`.

use tokio_util::sync::CancellationToken;

/// Owner of the process-wide stop signal.
#[derive(Debug, Clone, Default)]
pub struct ShutdownArbiter {
    token: CancellationToken,
}

impl ShutdownArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the worker should keep polling for work.
    pub fn should_keep_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// The root token. Clone it or derive child tokens from it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request a stop. Idempotent.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown requested");
        }
        self.token.cancel();
    }

    /// Spawns a task that triggers the arbiter on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let arbiter = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => arbiter.trigger(),
                _ = arbiter.token.cancelled() => {}
            }
        })
    }
}

/// Resolves when the process receives SIGINT or SIGTERM (Ctrl+C elsewhere).
///
/// If a handler cannot be installed the error is logged and the future never
/// resolves, leaving shutdown to other triggers.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigint.recv() => tracing::info!(signal = "SIGINT", "shutdown signal"),
            _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "shutdown signal"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            return std::future::pending().await;
        }
        tracing::info!("shutdown signal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_idempotent() {
        let arbiter = ShutdownArbiter::new();
        assert!(arbiter.should_keep_running());

        arbiter.trigger();
        arbiter.trigger();
        assert!(!arbiter.should_keep_running());
        assert!(arbiter.token().is_cancelled());
    }

    #[test]
    fn test_child_tokens_observe_trigger() {
        let arbiter = ShutdownArbiter::new();
        let child = arbiter.token().child_token();
        let cloned = arbiter.clone();

        cloned.trigger();
        assert!(child.is_cancelled());
        assert!(!arbiter.should_keep_running());
    }

    #[tokio::test]
    async fn test_signal_listener_exits_on_trigger() {
        let arbiter = ShutdownArbiter::new();
        let handle = arbiter.listen_for_signals();

        arbiter.trigger();
        handle.await.expect("listener task should finish");
    }
}
