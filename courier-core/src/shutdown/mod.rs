//! Graceful shutdown coordinator
//!
//! Background loops hold a [`ShutdownListener`] and exit at their next
//! suspension point once [`ShutdownCoordinator::shutdown`] is called.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Broadcasts a one-shot stop signal to every subscribed loop
#[derive(Debug)]
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

/// Receiving half handed to background loops
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener { rx: self.tx.subscribe() }
    }

    /// Signal every listener. Calling twice is harmless.
    pub fn shutdown(&self) {
        let changed = self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });

        if changed {
            info!("Initiating graceful shutdown");
        } else {
            warn!("Shutdown already in progress");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownListener {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been signalled, or the coordinator is gone
    pub async fn wait(&mut self) {
        // wait_for only errors when the sender was dropped; treat that as a stop
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Install SIGTERM/SIGINT handlers that trigger shutdown
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        coordinator.shutdown();
    });

    Ok(())
}

/// Install a Ctrl+C handler that triggers shutdown
#[cfg(not(unix))]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) -> std::io::Result<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C");
                coordinator.shutdown();
            }
            Err(e) => warn!("Ctrl+C handler failed: {}", e),
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listeners_observe_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let mut listener = coordinator.subscribe();
        assert!(!listener.is_shutdown());
        assert!(!coordinator.is_shutting_down());

        let waiter = tokio::spawn(async move {
            listener.wait().await;
            listener.is_shutdown()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.shutdown();
        assert!(waiter.await.unwrap());
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();
        coordinator.shutdown();

        let mut listener = coordinator.subscribe();
        assert!(listener.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), listener.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_coordinator_releases_waiters() {
        let coordinator = ShutdownCoordinator::new();
        let mut listener = coordinator.subscribe();
        drop(coordinator);

        tokio::time::timeout(Duration::from_secs(1), listener.wait())
            .await
            .unwrap();
    }
}
