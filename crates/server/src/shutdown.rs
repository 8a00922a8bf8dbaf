use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on SIGTERM or SIGINT (Ctrl+C elsewhere)
pub fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Failed to create SIGTERM handler: {}", e);
                    signal::ctrl_c().await.ok();
                    token.cancel();
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down");
                }
                _ = signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            tracing::info!("Received Ctrl+C, shutting down");
        }

        token.cancel();
    });
}
