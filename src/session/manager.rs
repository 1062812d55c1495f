//! Registry of live sessions.
//!
//! The manager creates sessions, hands orphaned ones back to reconnecting
//! clients, wires notebook file watching and tears everything down on
//! shutdown.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{GlobalConfig, WatcherOnSave};
use crate::kernel::KernelLauncher;
use crate::mode::SessionMode;
use crate::models::ops::{KernelMessage, MessageOperation};
use crate::models::requests::{AppMetadata, ControlRequest, ExecuteMultipleRequest};
use crate::models::SessionId;
use crate::notebook::{FileRouter, NEW_FILE_PREFIX};
use crate::session::consumer::{ConnectionState, SessionConsumer};
use crate::session::serialize::SERVER_VERSION;
use crate::session::session::{Session, SessionOptions};
use crate::session::watcher::{FileWatcherManager, WatchCallback};
use crate::tokens::{AuthToken, SkewProtectionToken};
use crate::{AppError, Result};

/// Inputs for a [`SessionManager`].
#[derive(Clone)]
pub struct SessionManagerOptions {
    /// Server configuration.
    pub config: Arc<GlobalConfig>,
    /// Resolves client file keys.
    pub file_router: Arc<dyn FileRouter>,
    /// Thread kernel entry point; required in run mode.
    pub launcher: Option<Arc<dyn KernelLauncher>>,
    /// Arguments given to the server after `--`, parsed.
    pub cli_args: BTreeMap<String, Value>,
    /// Arguments given to the server after `--`, raw.
    pub argv: Vec<String>,
    /// Token clients must present.
    pub auth_token: AuthToken,
    /// Token tying client bundles to this server.
    pub skew_protection_token: SkewProtectionToken,
}

impl fmt::Debug for SessionManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManagerOptions")
            .field("mode", &self.config.mode)
            .field("argv", &self.argv)
            .finish_non_exhaustive()
    }
}

/// Owns every session of the server.
pub struct SessionManager {
    config: Arc<GlobalConfig>,
    file_router: Arc<dyn FileRouter>,
    launcher: Option<Arc<dyn KernelLauncher>>,
    cli_args: BTreeMap<String, Value>,
    argv: Vec<String>,
    auth_token: AuthToken,
    skew_protection_token: SkewProtectionToken,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    creation: tokio::sync::Mutex<()>,
    watcher: FileWatcherManager,
    orphan_timers: Mutex<HashMap<SessionId, CancellationToken>>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("mode", &self.config.mode)
            .field("sessions", &self.session_count())
            .field("watcher", &self.watcher)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SessionManager {
    /// Create a manager with no sessions.
    #[must_use]
    pub fn new(options: SessionManagerOptions) -> Self {
        Self {
            config: options.config,
            file_router: options.file_router,
            launcher: options.launcher,
            cli_args: options.cli_args,
            argv: options.argv,
            auth_token: options.auth_token,
            skew_protection_token: options.skew_protection_token,
            sessions: Mutex::new(HashMap::new()),
            creation: tokio::sync::Mutex::new(()),
            watcher: FileWatcherManager::new(),
            orphan_timers: Mutex::new(HashMap::new()),
        }
    }

    /// Server mode.
    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.config.mode
    }

    /// Server configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<GlobalConfig> {
        &self.config
    }

    /// Token clients must present.
    #[must_use]
    pub fn auth_token(&self) -> &AuthToken {
        &self.auth_token
    }

    /// Token tying client bundles to this server.
    #[must_use]
    pub fn skew_protection_token(&self) -> &SkewProtectionToken {
        &self.skew_protection_token
    }

    /// File watchers of this manager.
    #[must_use]
    pub fn watcher(&self) -> &FileWatcherManager {
        &self.watcher
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    // ── Lookup ────────────────────────────────────────────────────────────

    /// Session registered under `session_id`, or the session one of whose
    /// consumers has that id.
    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.find_registered(session_id).map(|(_, session)| session)
    }

    /// Session registered under exactly `session_id`. Consumer ids do not
    /// match.
    #[must_use]
    pub fn get_registered_session(&self, session_id: &str) -> Option<Arc<Session>> {
        lock(&self.sessions).get(session_id).map(Arc::clone)
    }

    /// Registry key and session for `id`, which may be a consumer id.
    fn find_registered(&self, id: &str) -> Option<(SessionId, Arc<Session>)> {
        let sessions = lock(&self.sessions);
        if let Some(session) = sessions.get(id) {
            return Some((id.to_owned(), Arc::clone(session)));
        }
        sessions
            .iter()
            .find(|(_, session)| session.consumer_ids().iter().any(|consumer| consumer == id))
            .map(|(key, session)| (key.clone(), Arc::clone(session)))
    }

    /// Session created for `file_key`, or serving the file it resolves to.
    #[must_use]
    pub fn get_session_by_file_key(&self, file_key: &str) -> Option<Arc<Session>> {
        let path = self.file_router.resolve_path(file_key);
        lock(&self.sessions)
            .values()
            .find(|session| {
                session.initialization_id() == file_key
                    || path.as_deref().is_some_and(|path| session.is_for_path(path))
            })
            .map(Arc::clone)
    }

    fn sessions_snapshot(&self) -> Vec<(SessionId, Arc<Session>)> {
        lock(&self.sessions)
            .iter()
            .map(|(id, session)| (id.clone(), Arc::clone(session)))
            .collect()
    }

    // ── Creation and resumption ───────────────────────────────────────────

    /// Return the session registered under `session_id`, creating it with
    /// `consumer` as main consumer if there is none. A closed session under
    /// that id is dropped and replaced.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::BadRequest` if `file_key`
    /// does not resolve, or any error of [`Session::create`].
    pub async fn create_session(
        self: &Arc<Self>,
        session_id: &str,
        consumer: Arc<dyn SessionConsumer>,
        query_params: BTreeMap<String, Vec<String>>,
        file_key: &str,
    ) -> Result<Arc<Session>> {
        let _creation = self.creation.lock().await;
        let existing = self.get_registered_session(session_id);
        if let Some(session) = existing {
            if !session.is_closed() {
                return Ok(session);
            }
            debug!(session_id, "replacing closed session");
            self.deregister(&session);
        }

        let span = info_span!("create_session", session_id, file_key);
        async {
            let app_file_manager = self.file_router.get_file_manager(file_key)?;
            let path = app_file_manager.path();
            let app_metadata = AppMetadata {
                query_params,
                filename: path.as_ref().map(|path| path.display().to_string()),
                cli_args: self.cli_args.clone(),
                argv: self.argv.clone(),
                app_config: app_file_manager.app_config(),
            };

            let session = Session::create(SessionOptions {
                initialization_id: file_key.to_owned(),
                config: Arc::clone(&self.config),
                app_file_manager,
                app_metadata,
                virtual_files_supported: true,
                launcher: self.launcher.clone(),
                consumer,
            })
            .await?;

            if self.config.mode == SessionMode::Edit && self.config.session_cache.enabled {
                let hit = session.sync_session_view_from_cache(SERVER_VERSION);
                debug!(hit, "session cache checked");
            }

            lock(&self.sessions).insert(session_id.to_owned(), Arc::clone(&session));
            self.deregister_on_close(&session);

            if self.config.watch && path.is_some() {
                if let Err(err) = self.start_file_watcher(&session) {
                    warn!(%err, "file watching unavailable for session");
                }
            }

            info!(sessions = self.session_count(), "session registered");
            Ok(session)
        }
        .instrument(span)
        .await
    }

    /// Find a session a reconnecting client may take over.
    ///
    /// In run mode only the ORPHANED session already registered under
    /// `new_session_id` qualifies. In edit mode sessions with dead kernels
    /// are closed first; then the single ORPHANED session for the same file
    /// is re-registered under `new_session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidSession` if more than one session edits
    /// the file.
    pub async fn maybe_resume_session(
        &self,
        new_session_id: &str,
        file_key: &str,
    ) -> Result<Option<Arc<Session>>> {
        if self.config.mode == SessionMode::Run {
            let session = self
                .get_session(new_session_id)
                .filter(|session| session.connection_state() == ConnectionState::Orphaned);
            if session.is_some() {
                debug!(session_id = new_session_id, "resumable run session found");
                self.cancel_orphan_expiry(new_session_id);
            }
            return Ok(session);
        }

        for (session_id, session) in self.sessions_snapshot() {
            if !session.kernel_is_alive() {
                info!(session_id = %session_id, "closing session with dead kernel");
                self.close_session(&session_id).await;
            }
        }

        let Some(path) = self.file_router.resolve_path(file_key) else {
            return Ok(None);
        };
        let matching: Vec<(SessionId, Arc<Session>)> = self
            .sessions_snapshot()
            .into_iter()
            .filter(|(_, session)| session.is_for_path(&path))
            .collect();

        let (old_id, session) = match matching.as_slice() {
            [] => return Ok(None),
            [(old_id, session)] => (old_id.clone(), Arc::clone(session)),
            _ => {
                return Err(AppError::InvalidSession(
                    "only one session should exist while editing".into(),
                ))
            }
        };

        let state = session.connection_state();
        if state != ConnectionState::Orphaned {
            debug!(session_id = %old_id, ?state, "session is not resumable");
            return Ok(None);
        }

        info!(old_id = %old_id, new_id = new_session_id, "resuming edit session");
        {
            let mut sessions = lock(&self.sessions);
            sessions.insert(new_session_id.to_owned(), Arc::clone(&session));
            if old_id != new_session_id {
                sessions.remove(&old_id);
            }
        }
        self.cancel_orphan_expiry(&old_id);
        Ok(Some(session))
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// Whether a client has an open connection to the file behind `key`.
    #[must_use]
    pub fn any_clients_connected(&self, key: &str) -> bool {
        if key.starts_with(NEW_FILE_PREFIX) {
            return false;
        }
        let Some(path) = self.file_router.resolve_path(key) else {
            return false;
        };
        lock(&self.sessions).values().any(|session| {
            session.connection_state() == ConnectionState::Open && session.is_for_path(&path)
        })
    }

    /// Whether cell code may be sent to clients.
    #[must_use]
    pub fn should_send_code_to_frontend(&self) -> bool {
        self.config.mode == SessionMode::Edit || self.config.include_code
    }

    /// Number of sessions with an open main consumer.
    #[must_use]
    pub fn get_active_connection_count(&self) -> usize {
        lock(&self.sessions)
            .values()
            .filter(|session| session.connection_state() == ConnectionState::Open)
            .count()
    }

    // ── Orphans ───────────────────────────────────────────────────────────

    /// Close `session_id` if it is still ORPHANED after its TTL.
    ///
    /// A later call for the same id replaces the pending timer.
    pub fn schedule_orphan_expiry(self: &Arc<Self>, session_id: &str) {
        let Some(session) = self.get_session(session_id) else {
            return;
        };
        let ttl = session.ttl();
        let cancel = CancellationToken::new();
        if let Some(previous) =
            lock(&self.orphan_timers).insert(session_id.to_owned(), cancel.clone())
        {
            previous.cancel();
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let session_id = session_id.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(ttl) => {}
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            lock(&manager.orphan_timers).remove(&session_id);
            let still_orphaned = manager
                .get_session(&session_id)
                .is_some_and(|session| session.connection_state() == ConnectionState::Orphaned);
            if still_orphaned {
                info!(session_id = %session_id, ?ttl, "closing orphaned session");
                manager.close_session(&session_id).await;
            }
        });
    }

    /// Drop a pending orphan timer, if any.
    pub fn cancel_orphan_expiry(&self, session_id: &str) {
        if let Some(cancel) = lock(&self.orphan_timers).remove(session_id) {
            cancel.cancel();
        }
    }

    // ── File watching ─────────────────────────────────────────────────────

    fn start_file_watcher(&self, session: &Arc<Session>) -> Result<()> {
        let Some(path) = session.path() else {
            return Ok(());
        };
        let id = self
            .watcher
            .add_callback(&path, file_change_callback(session, self.config.runtime.watcher_on_save))?;
        if let Some((old_path, old_id)) = session.set_file_watch(path, id) {
            self.watcher.remove_callback(&old_path, old_id);
        }
        Ok(())
    }

    fn stop_file_watcher(&self, session: &Session) {
        if let Some((path, id)) = session.take_file_watch() {
            self.watcher.remove_callback(&path, id);
        }
    }

    /// Follow a session's notebook to `new_path` after a rename.
    ///
    /// The session cache moves with the notebook and, when watching, the
    /// watcher is re-registered for the new path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if there is no such session or
    /// `new_path` does not exist, and `AppError::BadRequest` if the session
    /// has no file. A failed watcher re-registration is returned after the
    /// watcher is re-armed on the session's current path.
    pub fn handle_file_rename_for_watch(
        &self,
        session_id: &str,
        prev_path: Option<&Path>,
        new_path: &Path,
    ) -> Result<()> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session not found: {session_id}")))?;
        if !new_path.exists() {
            return Err(AppError::NotFound(format!(
                "file {} does not exist",
                new_path.display()
            )));
        }
        if session.path().is_none() {
            return Err(AppError::BadRequest("session has no associated file".into()));
        }

        session.rename_cache_path(new_path.to_path_buf());

        if !self.config.watch {
            return Ok(());
        }
        if let Some(prev_path) = prev_path {
            if let Some((path, id)) = session.take_file_watch() {
                if path == absolute_path(prev_path) {
                    self.watcher.remove_callback(&path, id);
                } else {
                    session.set_file_watch(path, id);
                }
            }
        }
        if let Err(err) = self.start_file_watcher(&session) {
            error!(%err, "error handling file rename");
            if let Err(err) = self.start_file_watcher(&session) {
                warn!(%err, "failed to re-arm file watcher");
            }
            return Err(err);
        }
        Ok(())
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    /// Close and unregister a session. `session_id` may also be the id of
    /// one of its consumers. Returns `false` if it was not found.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let Some((key, session)) = self.find_registered(session_id) else {
            return false;
        };
        debug!(session_id = %key, "closing session");
        self.cancel_orphan_expiry(&key);
        self.stop_file_watcher(&session);
        session.close().await;
        lock(&self.sessions).remove(&key);
        true
    }

    /// Drop `session` from the registry once it closes, whoever closed it.
    fn deregister_on_close(self: &Arc<Self>, session: &Arc<Session>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let closed = session.closed_signal();
        let session = Arc::downgrade(session);
        tokio::spawn(async move {
            closed.cancelled().await;
            if let (Some(manager), Some(session)) = (manager.upgrade(), session.upgrade()) {
                manager.deregister(&session);
            }
        });
    }

    /// Remove every registry entry pointing at `session` and release its
    /// watcher and orphan timers.
    fn deregister(&self, session: &Arc<Session>) {
        let keys: Vec<SessionId> = {
            let mut sessions = lock(&self.sessions);
            let keys: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, registered)| Arc::ptr_eq(registered, session))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                sessions.remove(key);
            }
            keys
        };
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.cancel_orphan_expiry(key);
        }
        self.stop_file_watcher(session);
        info!(?keys, sessions = self.session_count(), "closed session deregistered");
    }

    /// Close every session.
    pub async fn close_all_sessions(&self) {
        let sessions: Vec<(SessionId, Arc<Session>)> =
            lock(&self.sessions).drain().collect();
        info!(count = sessions.len(), "closing all sessions");
        for (session_id, session) in sessions {
            self.cancel_orphan_expiry(&session_id);
            self.stop_file_watcher(&session);
            session.close().await;
        }
    }

    /// Close every session and stop every file watcher.
    pub async fn shutdown(&self) {
        self.close_all_sessions().await;
        self.watcher.stop_all();
        info!("session manager shut down");
    }
}

fn file_change_callback(session: &Arc<Session>, on_save: WatcherOnSave) -> WatchCallback {
    let session = Arc::downgrade(session);
    Arc::new(move |path: &Path| {
        let Some(session) = session.upgrade() else {
            return;
        };
        if !session.is_for_path(path) {
            return;
        }
        handle_file_change(&session, on_save);
    })
}

/// Push an externally edited notebook to a session's consumers.
///
/// Run mode asks consumers to reload. Edit mode sends the new cell order,
/// then either runs the changed cells or marks all code stale. A notebook
/// that fails to reload is left as it was.
pub fn handle_file_change(session: &Session, on_save: WatcherOnSave) {
    let file_manager = session.app_file_manager();
    let changed = match file_manager.reload() {
        Ok(changed) => changed,
        Err(err) => {
            warn!(%err, path = ?file_manager.path(), "notebook reload failed; changes skipped");
            return;
        }
    };
    debug!(path = ?file_manager.path(), changed = changed.len(), "notebook changed on disk");

    if session.mode() == SessionMode::Run {
        session.write_operation(&MessageOperation::Reload {}, None);
        return;
    }

    let cells = file_manager.cell_data();
    let cell_ids: Vec<_> = cells.iter().map(|cell| cell.cell_id.clone()).collect();
    session.write_operation(
        &MessageOperation::UpdateCellIds {
            cell_ids: cell_ids.clone(),
        },
        None,
    );

    match on_save {
        WatcherOnSave::Autorun => {
            let (cell_ids, codes): (Vec<_>, Vec<_>) = cells
                .into_iter()
                .filter(|cell| changed.contains(&cell.cell_id))
                .map(|cell| (cell.cell_id, cell.code))
                .unzip();
            let request = ControlRequest::ExecuteMultiple(ExecuteMultipleRequest {
                cell_ids,
                codes,
                request: None,
            });
            if let Err(err) = session.put_control_request(request, None) {
                warn!(%err, "failed to run changed cells");
            }
        }
        WatcherOnSave::Lazy => {
            session.write_operation(
                &MessageOperation::UpdateCellCodes {
                    cell_ids,
                    codes: cells.into_iter().map(|cell| cell.code).collect(),
                    code_is_stale: true,
                },
                None,
            );
        }
    }
}

/// Write `operation` to the consumer with `consumer_id`, if the session is open.
pub fn send_message_to_consumer(
    session: &Session,
    operation: &MessageOperation,
    consumer_id: Option<&str>,
) {
    if session.connection_state() != ConnectionState::Open {
        return;
    }
    let Some(consumer) = consumer_id.and_then(|id| session.room().get_consumer(id)) else {
        return;
    };
    consumer.write_operation(&KernelMessage::from(operation));
}

fn absolute_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
