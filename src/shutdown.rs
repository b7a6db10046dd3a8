use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` cancelled on the first signal. Subsystems
/// watch the token and drain; dropping the coordination-store session on the
/// way out lets ephemerals (locks, liveness, ownership) evaporate.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for interrupt");
                }
                tracing::info!("Received interrupt, initiating graceful shutdown");
            }
        }
        token_clone.cancel();
    });

    token
}
