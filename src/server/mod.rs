use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;

use crate::error::AppResult;
use crate::state::AppState;
use crate::supervisor::cli::CliStatus;

pub mod hooks;
pub mod ws;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/claude-notification", post(hooks::claude_notification))
        .route("/api/claude-stopped", post(hooks::claude_stopped))
        .route("/api/health", get(health))
        .route("/api/cli", get(cli_status))
        .with_state(state)
}

/// Binds and serves until Ctrl-C, SIGTERM or an internal shutdown. The
/// returned future resolves once the listener has drained.
pub async fn serve(state: AppState) -> AppResult<()> {
    let addr = state.config.bind_addr.clone();
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = TcpListener::bind(&addr).await?;
    log::info!("[Server] Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    log::info!("[Server] Stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: tokio_util::sync::CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("[Server] Failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("[Server] Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("[Server] Received Ctrl-C"),
        _ = terminate => log::info!("[Server] Received SIGTERM"),
        _ = shutdown.cancelled() => log::info!("[Server] Shutdown requested"),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Cached result of the CLI presence probe, re-run on demand elsewhere.
async fn cli_status(State(state): State<AppState>) -> Json<CliStatus> {
    Json(state.cli_status.lock().await.clone())
}
