//! Signal handling for graceful shutdown.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Time each worker gets to drain after the signal.
pub const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Completes when SIGTERM or SIGINT (Ctrl+C) arrives.
pub async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            info!("received SIGINT, initiating graceful shutdown");
        }
    }
}

/// A watch channel flipped to `true` on the first shutdown signal.
/// Workers observe the receiver at every suspension point.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Spawn the signal listener that flips the channel.
pub fn spawn_signal_listener(tx: watch::Sender<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    })
}

/// Await worker handles under the drain timeout. Returns false if any
/// worker failed to stop in time; the process should then exit non-zero.
pub async fn drain(handles: Vec<JoinHandle<()>>) -> bool {
    let all = futures_util::future::join_all(handles);
    tokio::time::timeout(DRAIN_TIMEOUT, all).await.is_ok()
}
