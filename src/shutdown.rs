use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// If a handler cannot be installed the other signal still works; if
/// neither can, the token is only cancelled by its owner.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| tracing::warn!(error = %e, "Failed to install SIGTERM handler"))
            .ok();
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| tracing::warn!(error = %e, "Failed to install SIGINT handler"))
            .ok();

        tokio::select! {
            Some(_) = recv(&mut sigterm) => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            Some(_) = recv(&mut sigint) => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = trigger.cancelled() => return,
        }

        trigger.cancel();
    });

    token
}

async fn recv(sig: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match sig {
        Some(sig) => sig.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves once `token` is cancelled. Suitable for
/// `axum::serve(..).with_graceful_shutdown(..)`.
pub async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
    tracing::info!("Shutting down, no longer accepting requests");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_shutdown_follows_token() {
        let token = CancellationToken::new();
        let waiter = tokio::spawn(wait_for_shutdown(token.clone()));

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn handler_token_can_be_cancelled_by_owner() {
        let token = install_shutdown_handler();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
