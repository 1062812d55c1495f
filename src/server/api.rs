//! Kernel request endpoints.
//!
//! Every request names its session in the `Session-Id` header. That id is
//! also the caller's consumer id, so the caller is left out of the
//! broadcasts its own request triggers. In edit mode requests also carry
//! the access token as `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::mode::SessionMode;
use crate::models::requests::{
    ControlRequest, ExecuteMultipleRequest, InstantiateRequest, SetUiElementValueRequest,
};
use crate::server::AppState;
use crate::session::Session;
use crate::{AppError, Result};

/// Header carrying the caller's session id.
pub const SESSION_ID_HEADER: &str = "Session-Id";

/// Body of `POST /api/kernel/stdin`.
#[derive(Debug, Clone, Deserialize)]
pub struct StdinRequest {
    /// Answer to the pending prompt.
    pub text: String,
}

fn session_id(headers: &HeaderMap) -> Result<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| AppError::BadRequest(format!("missing {SESSION_ID_HEADER} header")))
}

/// Middleware guarding `/api/kernel/*`: edit mode requires the access token.
///
/// # Errors
///
/// Returns `AppError::Unauthorized` if the bearer token is missing or wrong.
pub async fn require_access_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    if state.manager.mode() == SessionMode::Edit {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or_default();
        if !state.manager.auth_token().verify(presented) {
            return Err(AppError::Unauthorized("invalid access token".into()));
        }
    }
    Ok(next.run(request).await)
}

/// The session registered under the caller's id. Kiosk consumers are
/// read-only and never qualify.
fn require_session(state: &AppState, headers: &HeaderMap) -> Result<(String, Arc<Session>)> {
    let id = session_id(headers)?;
    let session = state
        .manager
        .get_registered_session(&id)
        .ok_or_else(|| AppError::NotFound(format!("session not found: {id}")))?;
    let room = session.room();
    let is_kiosk = room.get_consumer(&id).is_some()
        && room.main_consumer_id().as_deref() != Some(id.as_str());
    if is_kiosk {
        return Err(AppError::Unauthorized(format!(
            "kiosk consumer {id} cannot send kernel requests"
        )));
    }
    Ok((id, session))
}

fn success() -> Json<Value> {
    Json(json!({ "success": true }))
}

/// `POST /api/kernel/run`
///
/// # Errors
///
/// Fails if the session is unknown, the request is malformed, or the
/// kernel queues are closed.
pub async fn run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ExecuteMultipleRequest>,
) -> Result<Json<Value>> {
    if request.cell_ids.len() != request.codes.len() {
        return Err(AppError::BadRequest("cell_ids and codes differ in length".into()));
    }
    let (id, session) = require_session(&state, &headers)?;
    session.put_control_request(ControlRequest::ExecuteMultiple(request), Some(&id))?;
    Ok(success())
}

/// `POST /api/kernel/set_ui_element_value`
///
/// # Errors
///
/// Fails if the session is unknown or the kernel queues are closed.
pub async fn set_ui_element_value(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SetUiElementValueRequest>,
) -> Result<Json<Value>> {
    let (id, session) = require_session(&state, &headers)?;
    session.put_control_request(ControlRequest::SetUiElementValue(request), Some(&id))?;
    Ok(success())
}

/// `POST /api/kernel/instantiate`
///
/// # Errors
///
/// Fails if the session is unknown or the kernel queues are closed.
pub async fn instantiate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InstantiateRequest>,
) -> Result<Json<Value>> {
    let (_, session) = require_session(&state, &headers)?;
    session.instantiate(&request, None)?;
    Ok(success())
}

/// `POST /api/kernel/interrupt`
///
/// # Errors
///
/// Fails if the session is unknown.
pub async fn interrupt(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let (_, session) = require_session(&state, &headers)?;
    session.try_interrupt();
    Ok(success())
}

/// `POST /api/kernel/stdin`
///
/// # Errors
///
/// Fails if the session is unknown or the kernel queues are closed.
pub async fn stdin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StdinRequest>,
) -> Result<Json<Value>> {
    let (_, session) = require_session(&state, &headers)?;
    session.put_input(request.text).await?;
    Ok(success())
}

/// `POST /api/kernel/shutdown`: close every session and stop the server.
///
/// # Errors
///
/// Fails if the caller does not name a known session.
pub async fn shutdown(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let (id, _) = require_session(&state, &headers)?;
    info!(session_id = %id, "shutdown requested");
    state.manager.shutdown().await;
    state.shutdown.cancel();
    Ok(success())
}
