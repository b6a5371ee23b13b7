use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Waits for SIGINT, SIGTERM or SIGQUIT and cancels `token` on the first one.
/// Runs in a loop since we want to stay responsive to further signals while a
/// slow shutdown is already in progress.
pub async fn signal_handler(token: CancellationToken) {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    loop {
        let signal = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigquit.recv() => "SIGQUIT",
        };

        if !token.is_cancelled() {
            info!("Got signal {signal}. Terminating gracefully.");
            token.cancel();
        } else {
            info!("Got signal {signal}. Already shutting down.");
        }
    }
}
