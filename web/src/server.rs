//! Serving the router with graceful shutdown.

use crate::passthrough::PassthroughPolicy;
use crate::router::router;
use crate::state::AppState;
use anyhow::Context;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// How long running flows get to finish after the listener closes.
const ENGINE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind `0.0.0.0:{port}` and serve until `state.shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the port cannot be bound, the server fails, or
/// flows are still running after the drain timeout.
pub async fn serve(state: AppState, policy: &PassthroughPolicy) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve_on(listener, state, policy).await
}

/// Serve on an already bound listener.
///
/// Cancelling `state.shutdown` stops accepting connections, releases every
/// waiting request, then drains the engine.
///
/// # Errors
///
/// See [`serve`].
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    policy: &PassthroughPolicy,
) -> anyhow::Result<()> {
    let app = router(state.clone(), policy);
    tracing::info!(
        addr = %listener.local_addr()?,
        base_url = %state.config.base_url,
        "Requesting server listening"
    );

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;

    state
        .engine
        .shutdown(ENGINE_DRAIN_TIMEOUT)
        .await
        .context("engine did not drain")?;
    Ok(())
}

/// Cancel `token` on Ctrl-C.
pub async fn shutdown_on_ctrl_c(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    tracing::info!("Ctrl-C received, shutting down");
    token.cancel();
}
