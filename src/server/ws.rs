//! WebSocket consumers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::mode::SessionMode;
use crate::models::ops::{KernelMessage, MessageOperation};
use crate::models::ConsumerId;
use crate::server::AppState;
use crate::session::{ConnectionState, ConsumerCallback, ConsumerRole, Session, SessionConsumer};
use crate::{AppError, Result};

/// Query string of `GET /ws`.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    /// Client-chosen session id; also the main consumer's id.
    pub session_id: String,
    /// File key of the notebook.
    pub file: String,
    /// Attach read-only to an existing session.
    #[serde(default)]
    pub kiosk: bool,
    /// Access token.
    #[serde(default)]
    pub access_token: Option<String>,
}

enum Outbound {
    Text(String),
    Close,
}

const OPEN: u8 = 0;
const CLOSED: u8 = 1;
const ORPHANED: u8 = 2;

/// Consumer writing JSON operations to one WebSocket.
///
/// Output is held back until [`WsConsumer::release`] so that the
/// `kernel-ready` snapshot is always the first frame a client sees.
pub struct WsConsumer {
    inner: Arc<Outlet>,
}

struct Outlet {
    id: ConsumerId,
    tx: mpsc::UnboundedSender<Outbound>,
    state: AtomicU8,
    held: Mutex<Option<Vec<String>>>,
}

impl fmt::Debug for WsConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConsumer")
            .field("id", &self.inner.id)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl Outlet {
    fn held(&self) -> MutexGuard<'_, Option<Vec<String>>> {
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn send_message(&self, message: &KernelMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(%err, op = %message.op, "dropping unencodable message");
                return;
            }
        };
        let mut held = self.held();
        if let Some(buffer) = held.as_mut() {
            buffer.push(text);
            return;
        }
        drop(held);
        if self.tx.send(Outbound::Text(text)).is_err() {
            debug!(consumer_id = %self.id, "socket gone; message dropped");
        }
    }
}

impl WsConsumer {
    fn new(id: ConsumerId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            inner: Arc::new(Outlet {
                id,
                tx,
                state: AtomicU8::new(OPEN),
                held: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    /// Send `first` ahead of everything held back, then stop holding.
    fn release(&self, first: &[MessageOperation]) {
        let mut held = self.inner.held();
        let pending = held.take().unwrap_or_default();
        let first = first
            .iter()
            .filter_map(|operation| serde_json::to_string(&KernelMessage::from(operation)).ok());
        for text in first.chain(pending) {
            let _ = self.inner.tx.send(Outbound::Text(text));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let raw = match state {
            ConnectionState::Open => OPEN,
            ConnectionState::Closed => CLOSED,
            ConnectionState::Orphaned => ORPHANED,
        };
        self.inner.state.store(raw, Ordering::SeqCst);
    }
}

impl SessionConsumer for WsConsumer {
    fn consumer_id(&self) -> ConsumerId {
        self.inner.id.clone()
    }

    fn on_start(&self) -> ConsumerCallback {
        let outlet = Arc::clone(&self.inner);
        Arc::new(move |message: &KernelMessage| outlet.send_message(message))
    }

    fn on_stop(&self) {
        self.set_state(ConnectionState::Closed);
        let _ = self.inner.tx.send(Outbound::Close);
    }

    fn write_operation(&self, message: &KernelMessage) {
        self.inner.send_message(message);
    }

    fn connection_state(&self) -> ConnectionState {
        match self.inner.state.load(Ordering::SeqCst) {
            OPEN => ConnectionState::Open,
            ORPHANED => ConnectionState::Orphaned,
            _ => ConnectionState::Closed,
        }
    }
}

/// Handler for `GET /ws`.
///
/// # Errors
///
/// Returns `AppError::Unauthorized` for a wrong access token in edit mode.
pub async fn handle_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    Query(raw): Query<Vec<(String, String)>>,
    upgrade: WebSocketUpgrade,
) -> Result<Response> {
    let manager = &state.manager;
    if manager.mode() == SessionMode::Edit {
        let presented = query.access_token.as_deref().unwrap_or_default();
        if !manager.auth_token().verify(presented) {
            return Err(AppError::Unauthorized("invalid access token".into()));
        }
    }

    let span = info_span!("ws_connection", session_id = %query.session_id, file = %query.file, kiosk = query.kiosk);
    let query_params = client_query_params(raw);
    Ok(upgrade.on_upgrade(move |socket| {
        run_connection(state, query, query_params, socket).instrument(span)
    }))
}

/// Query parameters forwarded to the kernel, minus connection plumbing.
fn client_query_params(raw: Vec<(String, String)>) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in raw {
        if matches!(key.as_str(), "session_id" | "access_token" | "file" | "kiosk") {
            continue;
        }
        params.entry(key).or_default().push(value);
    }
    params
}

async fn run_connection(
    state: AppState,
    query: WsQuery,
    query_params: BTreeMap<String, Vec<String>>,
    mut socket: WebSocket,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = Arc::new(WsConsumer::new(query.session_id.clone(), tx));

    let session = match attach(&state, &query, query_params, &consumer).await {
        Ok(session) => session,
        Err(err) => {
            warn!(%err, "websocket attach failed");
            let _ = socket
                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: 1011,
                    reason: err.to_string().into(),
                })))
                .await;
            return;
        }
    };

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    detach(&state, &query, &consumer, &session);
}

async fn attach(
    state: &AppState,
    query: &WsQuery,
    query_params: BTreeMap<String, Vec<String>>,
    consumer: &Arc<WsConsumer>,
) -> Result<Arc<Session>> {
    let manager = &state.manager;
    let include_code = manager.should_send_code_to_frontend();
    let as_consumer = Arc::clone(consumer) as Arc<dyn SessionConsumer>;

    if query.kiosk {
        let session = manager
            .get_session_by_file_key(&query.file)
            .ok_or_else(|| AppError::NotFound(format!("no session for {}", query.file)))?;
        let replay = session.resume_consumer(as_consumer, ConsumerRole::Kiosk)?;
        let mut first = vec![session.kernel_ready(true, true, include_code)];
        first.extend(replay);
        consumer.release(&first);
        info!("kiosk consumer attached");
        return Ok(session);
    }

    if let Some(session) = manager
        .maybe_resume_session(&query.session_id, &query.file)
        .await?
    {
        let replay = session.resume_consumer(as_consumer, ConsumerRole::Main)?;
        let mut first = vec![session.kernel_ready(true, false, include_code)];
        first.extend(replay);
        first.push(MessageOperation::Reconnected {});
        consumer.release(&first);
        info!("session resumed");
        return Ok(session);
    }

    if manager
        .get_session(&query.session_id)
        .is_some_and(|session| !session.is_closed())
    {
        return Err(AppError::Consumer(format!(
            "session {} is already connected",
            query.session_id
        )));
    }

    let session = manager
        .create_session(
            &query.session_id,
            as_consumer,
            query_params,
            &query.file,
        )
        .await?;
    consumer.release(&[session.kernel_ready(false, false, include_code)]);
    Ok(session)
}

fn detach(state: &AppState, query: &WsQuery, consumer: &WsConsumer, session: &Session) {
    if consumer.connection_state() == ConnectionState::Open {
        consumer.set_state(ConnectionState::Closed);
    }
    if query.kiosk {
        session.disconnect_consumer(&consumer.inner.id);
        return;
    }
    if session.maybe_disconnect_consumer() {
        info!("main consumer gone; session orphaned");
        state.manager.schedule_orphan_expiry(&query.session_id);
    }
}
