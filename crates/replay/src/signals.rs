//! Interrupt handling for the replay run.
//!
//! Resolves on SIGTERM or SIGINT on Unix platforms and Ctrl+C elsewhere so
//! the caller can cancel the resolver instead of waiting it out.

use std::future::pending;

use tracing::{info, warn};

/// Wait for an interrupt (SIGTERM, SIGINT, or Ctrl+C).
///
/// If a handler cannot be installed, that signal is never reported.
pub async fn wait_for_interrupt() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
