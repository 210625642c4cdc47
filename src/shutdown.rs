use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, cancelling run...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, cancelling run...");
        }
    }
}

/// Cancel `token` on the first shutdown signal. The run stops at its next
/// stage boundary; a push already in progress is allowed to finish.
pub async fn cancel_on_signal(token: CancellationToken) {
    tokio::select! {
        _ = wait_for_shutdown() => token.cancel(),
        _ = token.cancelled() => {}
    }
}
