//! HTTP and WebSocket surface.
//!
//! `GET /ws` attaches a [`ws::WsConsumer`] to a session. Kernel requests
//! arrive as `POST /api/kernel/*` calls naming their session in the
//! `Session-Id` header; [`api::require_access_token`] guards them.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::session::SessionManager;
use crate::{AppError, Result};

pub mod api;
pub mod ws;

/// Shared state of every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Session registry.
    pub manager: Arc<SessionManager>,
    /// Cancelled to stop the server.
    pub shutdown: CancellationToken,
    /// Server start time, reported by `/health`.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// State for a server starting now.
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            shutdown,
            started_at: Utc::now(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(err = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Handler for `GET /health`.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "started_at": state.started_at.to_rfc3339(),
        "active_connections": state.manager.get_active_connection_count(),
        "sessions": state.manager.session_count(),
    }))
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let kernel_api = Router::new()
        .route("/api/kernel/run", post(api::run))
        .route("/api/kernel/set_ui_element_value", post(api::set_ui_element_value))
        .route("/api/kernel/instantiate", post(api::instantiate))
        .route("/api/kernel/interrupt", post(api::interrupt))
        .route("/api/kernel/stdin", post(api::stdin))
        .route("/api/kernel/shutdown", post(api::shutdown))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api::require_access_token,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::handle_ws))
        .merge(kernel_api)
        .with_state(state)
}

/// Serve until `state.shutdown` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the address cannot be bound, and
/// `AppError::Io` if the server fails while running.
pub async fn serve(state: AppState) -> Result<()> {
    let config = state.manager.config();
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|err| AppError::Config(format!("invalid listen address: {err}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {addr}: {err}")))?;
    info!(%addr, mode = ?config.mode, "notebook server listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("server error: {err}")))?;

    info!("notebook server stopped");
    Ok(())
}
