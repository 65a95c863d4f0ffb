//! Graceful Shutdown Handler
//!
//! Fans one shutdown request out to the control loop, the execution worker,
//! the watchdog and the HTTP server.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / SIGTERM or a control command
    Graceful,
    /// A component hit an unrecoverable error
    Fatal,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Fatal => write!(f, "fatal"),
        }
    }
}

pub struct GracefulShutdown {
    requested: AtomicBool,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(8);
        Self {
            requested: AtomicBool::new(false),
            signal_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown; later requests are ignored
    pub fn trigger(&self, signal: ShutdownSignal) {
        if self.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutdown requested ({})", signal);
        if self.signal_tx.send(signal).is_err() {
            warn!("Shutdown requested with no listeners");
        }
    }

    /// Resolve on Ctrl-C (and SIGTERM on unix), then trigger
    pub async fn listen_for_signals(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("SIGTERM handler unavailable: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        self.trigger(ShutdownSignal::Graceful);
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_once() {
        let shutdown = GracefulShutdown::new();
        let mut rx = shutdown.subscribe();
        shutdown.trigger(ShutdownSignal::Graceful);
        shutdown.trigger(ShutdownSignal::Fatal);
        assert_eq!(rx.recv().await.unwrap(), ShutdownSignal::Graceful);
        assert!(rx.try_recv().is_err());
        assert!(shutdown.is_requested());
    }
}
