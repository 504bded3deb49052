/// Waits for a signal that requests a graceful shutdown, like SIGTERM or SIGINT.
#[cfg(unix)]
pub async fn wait_for_signal_impl() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut signal_terminate, mut signal_interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!("failed to register signal handlers, falling back to ctrl-c: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = signal_terminate.recv() => tracing::debug!("received SIGTERM."),
        _ = signal_interrupt.recv() => tracing::debug!("received SIGINT."),
    };
}

/// Waits for Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_signal_impl() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    tracing::debug!("received CTRL_C.");
}

/// Registers signal handlers and waits for a signal that
/// indicates a shutdown request.
pub async fn wait_for_signal() {
    wait_for_signal_impl().await
}
