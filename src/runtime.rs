//! Runtime - shutdown signalling for service tasks and the process

use std::sync::Arc;
use tokio::sync::watch;

/// One-way shutdown latch. Clones share the latch; once triggered it stays
/// triggered, and `wait` resolves immediately for late callers.
#[derive(Clone)]
pub struct Shutdown {
    latch: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self { Self::new() }
}

impl Shutdown {
    pub fn new() -> Self {
        let (latch, _) = watch::channel(false);
        Self { latch: Arc::new(latch) }
    }

    /// Trigger shutdown. Only the first call has an effect.
    pub async fn trigger(&self) {
        let first = self.latch.send_if_modified(|triggered| !std::mem::replace(triggered, true));
        if first {
            tracing::debug!("Shutdown triggered");
        }
    }

    pub async fn is_triggered(&self) -> bool {
        *self.latch.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.latch.subscribe();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

/// Shutdown handle that fires on SIGINT/SIGTERM (Ctrl+C elsewhere).
pub fn install_signal_handlers() -> Shutdown {
    let shutdown = Shutdown::new();
    let handle = shutdown.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!("Signal handlers unavailable: {}", e);
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                _ = sigint.recv() => tracing::info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Ctrl+C handler unavailable: {}", e);
                return;
            }
            tracing::info!("Received Ctrl+C");
        }

        handle.trigger().await;
    });

    shutdown
}
