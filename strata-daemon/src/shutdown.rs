//! Graceful shutdown handling for stratad.
//!
//! Lifecycle operations are not cancelled: whatever is mid-flight is left in
//! its persisted starting/stopping state and resumed on the next start.

use crate::orchestrator::ReconcilerHandle;
use std::sync::Arc;
use strata_core::{StackStatus, StateManager};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Manages graceful shutdown of the daemon.
pub struct ShutdownManager {
    state: Arc<StateManager>,
    reconciler: ReconcilerHandle,
}

impl ShutdownManager {
    pub fn new(state: Arc<StateManager>, reconciler: ReconcilerHandle) -> Self {
        Self { state, reconciler }
    }

    /// Stop consuming cluster events and close the database.
    pub async fn shutdown(self) {
        info!("Starting graceful shutdown...");

        self.reconciler.abort();

        match self.state.list_all_stacks().await {
            Ok(stacks) => {
                for (account, stack) in stacks {
                    if matches!(stack.status, StackStatus::Starting | StackStatus::Stopping) {
                        warn!(
                            "Stack {}/{} is {}, it will be resumed on next start",
                            account, stack.id, stack.status
                        );
                    }
                }
            }
            Err(e) => error!("Failed to list stacks for shutdown: {}", e),
        }

        self.state.pool().close().await;
        info!("Graceful shutdown complete");
    }
}

/// Create a shutdown signal receiver.
///
/// Returns a broadcast receiver that will receive a signal when
/// SIGTERM or SIGINT is received.
pub fn shutdown_signal() -> broadcast::Receiver<()> {
    let (tx, rx) = broadcast::channel(1);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        let _ = tx.send(());
    });

    rx
}
