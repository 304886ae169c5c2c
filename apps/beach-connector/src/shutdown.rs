use tokio_util::sync::CancellationToken;

/// Returns a token that is cancelled on SIGTERM or SIGINT (ctrl-c elsewhere).
///
/// Handlers are registered before this returns so a signal that arrives
/// during startup is not lost.
#[cfg(unix)]
pub fn install() -> std::io::Result<CancellationToken> {
    use tokio::signal::unix::{SignalKind, signal};

    let token = CancellationToken::new();
    let trigger = token.clone();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!(target: "connector::shutdown", "received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                tracing::info!(target: "connector::shutdown", "received SIGINT, shutting down");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}

#[cfg(not(unix))]
pub fn install() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!(target: "connector::shutdown", "received ctrl-c, shutting down"),
            Err(err) => tracing::warn!(target: "connector::shutdown", error = %err, "ctrl-c handler failed"),
        }
        trigger.cancel();
    });
    Ok(token)
}
