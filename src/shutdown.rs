//! Graceful shutdown signal (spec.md §5 "Shutdown").
//!
//! A single `tokio::sync::watch` channel broadcasts shutdown to every task:
//! the serial ingest loop flushes its in-flight transaction, the delivery
//! loop and health server stop accepting new work, then the process exits.

use tokio::sync::watch;
use tracing::info;

pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Wait for SIGINT (Ctrl+C) or, on Unix, SIGTERM, then flip the shared
/// shutdown flag.
pub async fn wait_for_signal(tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }

    let _ = tx.send(true);
}
