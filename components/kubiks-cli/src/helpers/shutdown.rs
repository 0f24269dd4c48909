// External crates
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Invocation-wide shutdown handle, built on top of a [`CancellationToken`]
///
/// - The process runner and the batch processor each hold a clone of the token.
/// - Calling `.trigger()` (or receiving Ctrl-C / SIGTERM once `.listen_for_signals()` is
///   running) cancels every clone at once.
/// - Cancellation is sticky: components that check the token late still see it.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Fresh, untriggered handle
    #[instrument(
        name = "kubiks_shutdown_channel",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn new() -> Self {
        tracing::trace!("Creating invocation shutdown token");
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token to hand to a component
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger shutdown, cancelling every token handed out
    #[instrument(
        name = "kubiks_shutdown_trigger",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn trigger(&self) {
        tracing::trace!("Shutdown triggered");
        self.token.cancel();
    }

    /// Spawn a task that triggers shutdown on Ctrl-C or SIGTERM.
    ///
    /// The task ends on its own once the token is cancelled by anyone else, which is how the
    /// CLI retires it after an invocation.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                signal = wait_for_signal() => {
                    tracing::warn!(signal, "Received termination signal, cancelling invocation");
                    token.cancel();
                }
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::debug!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        name = ctrl_c() => name,
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "SIGINT",
        Err(e) => {
            tracing::debug!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending().await
        }
    }
}
