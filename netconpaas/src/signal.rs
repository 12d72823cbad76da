use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Cancels `cancel_token` on Ctrl+C or SIGTERM. Returns once either a signal
/// arrived or the token was cancelled elsewhere.
pub async fn cancel_on_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::warn!("Ctrl+C received"),
            Err(e) => {
                tracing::error!("failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::warn!("Terminate signal received");
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel_token.cancelled() => return,
    }
    cancel_token.cancel();
}
