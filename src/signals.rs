//! Termination signals.

use tracing::info;

/// Resolves when the process is asked to stop.
///
/// Kubernetes stops pods with SIGTERM; ctrl+c covers local runs. On
/// non-unix hosts only ctrl+c is available.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received ctrl+c, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl+c, shutting down");
    }
}
