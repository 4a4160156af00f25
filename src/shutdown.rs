use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler for SIGTERM, SIGINT and SIGHUP.
///
/// The returned token is cancelled on the first of those signals. Server
/// subsystems drain on it; a one-shot agent turns it into a kill of its job.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let token = CancellationToken::new();
    let token_clone = token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sighup.recv() => "SIGHUP",
        };
        tracing::info!(signal = name, "Received signal, initiating shutdown");
        token_clone.cancel();
    });

    Ok(token)
}
