use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Token cancelled on SIGTERM or SIGINT.
///
/// In `loadpilot server` it stops the scheduler's poll loop, cancels the
/// active job and shuts the gRPC server down. In `loadpilot executor` it
/// acts like a `Terminate` call: virtual users are cancelled and the control
/// endpoint closes once the run has wound down.
///
/// Must be called from within a tokio runtime.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let watched = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            name = next_signal() => {
                tracing::info!(signal = name, "Shutting down");
                watched.cancel();
            }
            // Cancelled from elsewhere, e.g. a Terminate call.
            _ = watched.cancelled() => {}
        }
    });

    token
}

async fn next_signal() -> &'static str {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
