//! Session view cache.
//!
//! A [`SessionCacheWriter`] periodically writes the session view to
//! `<notebook dir>/__marimo__/session/<notebook file>.json`. On startup a
//! [`SessionCacheManager`] can restore the view from that file, but only
//! when every cell's code hash and the server version match exactly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::models::ops::{CellChannel, CellOp, CellOutput, RuntimeState};
use crate::models::requests::CellConfig;
use crate::models::CellId;
use crate::notebook::CellData;
use crate::session::view::SessionView;
use crate::{AppError, Result};

/// Schema version of the session cache document.
pub const SESSION_SCHEMA_VERSION: &str = "1";

/// Version recorded in, and required of, cache documents.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Mimetype used when a cached output carries several representations.
pub const MIMEBUNDLE_MIMETYPE: &str = "application/vnd.marimo+mimebundle";

// ── Cache document ───────────────────────────────────────────────────────────

/// Cache document metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Server version that wrote the document.
    pub marimo_version: Option<String>,
}

/// Serialized cell output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionOutput {
    /// An error raised by the cell.
    Error {
        /// Error type name.
        ename: String,
        /// Error message.
        evalue: String,
        /// Traceback lines.
        #[serde(default)]
        traceback: Vec<String>,
    },
    /// Rendered data, keyed by mimetype.
    Data {
        /// Mimetype to payload.
        data: BTreeMap<String, Value>,
    },
}

/// Console stream of a serialized console entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Serialized console entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionConsole {
    /// Text written to stdout or stderr.
    #[serde(rename = "stream")]
    Stream {
        /// Stream written to.
        name: StreamName,
        /// Text written.
        text: String,
    },
    /// Media written to the console.
    #[serde(rename = "streamMedia")]
    StreamMedia {
        /// Always `media`.
        name: String,
        /// Media mimetype.
        mimetype: String,
        /// Encoded media.
        data: String,
    },
}

/// One cell in a cache document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCell {
    /// Cell id.
    pub id: CellId,
    /// Hash of the code that produced the outputs; `None` for empty code.
    pub code_hash: Option<String>,
    /// Outputs of the last run.
    #[serde(default)]
    pub outputs: Vec<SessionOutput>,
    /// Console of the last run.
    #[serde(default)]
    pub console: Vec<SessionConsole>,
}

/// Session cache document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookSession {
    /// Schema version.
    pub version: String,
    /// Writer metadata.
    pub metadata: SessionMetadata,
    /// Cells in notebook order.
    pub cells: Vec<SessionCell>,
}

/// Exported cell of [`serialize_notebook`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookCell {
    /// Cell id.
    pub id: CellId,
    /// Last run code, empty if never run.
    pub code: String,
    /// Hash of `code`.
    pub code_hash: Option<String>,
    /// Cell name.
    pub name: Option<String>,
    /// Cell configuration.
    pub config: CellConfig,
}

/// Notebook export document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookExport {
    /// Schema version.
    pub version: String,
    /// Writer metadata.
    pub metadata: SessionMetadata,
    /// Cells in document order.
    pub cells: Vec<NotebookCell>,
}

/// What a cache document must match to be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCacheKey {
    /// Code of every cell, in notebook order.
    pub codes: Vec<Option<String>>,
    /// Server version.
    pub version: String,
}

// ── Conversion ───────────────────────────────────────────────────────────────

/// Hex SHA-256 of `code`; `None` for absent or empty code.
#[must_use]
pub fn hash_code(code: Option<&str>) -> Option<String> {
    let code = code.filter(|code| !code.is_empty())?;
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

/// Cache file for a notebook: `foo/bar.py` → `foo/__marimo__/session/bar.py.json`.
#[must_use]
pub fn get_session_cache_file(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "notebook".into(), |name| name.to_string_lossy().into_owned());
    path.parent()
        .unwrap_or_else(|| Path::new(""))
        .join("__marimo__")
        .join("session")
        .join(format!("{name}.json"))
}

fn normalize_error(error: &Value) -> SessionOutput {
    let field = |key: &str| error.get(key).and_then(Value::as_str).map(str::to_owned);
    SessionOutput::Error {
        ename: field("type").unwrap_or_else(|| "UnknownError".into()),
        evalue: field("msg").unwrap_or_default(),
        traceback: error
            .get("traceback")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn serialize_cell(view: &SessionView, cell_id: &str) -> SessionCell {
    let Some(op) = view.cell_operation(cell_id) else {
        return SessionCell {
            id: cell_id.to_owned(),
            code_hash: None,
            outputs: Vec::new(),
            console: Vec::new(),
        };
    };

    let mut outputs = Vec::new();
    if let Some(output) = &op.output {
        if output.channel == CellChannel::MarimoError {
            if let Some(errors) = output.data.as_array() {
                outputs.extend(errors.iter().map(normalize_error));
            }
        } else {
            outputs.push(SessionOutput::Data {
                data: BTreeMap::from([(output.mimetype.clone(), output.data.clone())]),
            });
        }
    }

    let console = op
        .console
        .iter()
        .flatten()
        .map(|entry| match entry.channel {
            CellChannel::Media => SessionConsole::StreamMedia {
                name: "media".into(),
                mimetype: entry.mimetype.clone(),
                data: value_text(&entry.data),
            },
            CellChannel::Stderr => SessionConsole::Stream {
                name: StreamName::Stderr,
                text: value_text(&entry.data),
            },
            _ => SessionConsole::Stream {
                name: StreamName::Stdout,
                text: value_text(&entry.data),
            },
        })
        .collect();

    SessionCell {
        id: cell_id.to_owned(),
        code_hash: hash_code(view.last_executed_code().get(cell_id).map(String::as_str)),
        outputs,
        console,
    }
}

/// Convert a view into a cache document, cells in notebook order.
#[must_use]
pub fn serialize_session_view(view: &SessionView) -> NotebookSession {
    if view.cell_ids().is_none() {
        debug!("notebook order unknown; serializing cells in first-seen order");
    }
    NotebookSession {
        version: SESSION_SCHEMA_VERSION.into(),
        metadata: SessionMetadata {
            marimo_version: Some(SERVER_VERSION.into()),
        },
        cells: view
            .ordered_cell_ids()
            .iter()
            .map(|cell_id| serialize_cell(view, cell_id))
            .collect(),
    }
}

fn output_from_cache(output: &SessionOutput) -> Option<CellOutput> {
    match output {
        SessionOutput::Error { ename, evalue, .. } => Some(CellOutput {
            channel: CellChannel::MarimoError,
            mimetype: "application/vnd.marimo+error".into(),
            data: serde_json::json!([{
                "type": "exception",
                "exception_type": ename,
                "msg": evalue,
                "raising_cell": null,
            }]),
            timestamp: 0.0,
        }),
        SessionOutput::Data { data } => match data.len() {
            0 => None,
            1 => data.iter().next().map(|(mimetype, value)| CellOutput {
                channel: CellChannel::Output,
                mimetype: mimetype.clone(),
                data: value.clone(),
                timestamp: 0.0,
            }),
            _ => Some(CellOutput {
                channel: CellChannel::Output,
                mimetype: MIMEBUNDLE_MIMETYPE.into(),
                data: serde_json::to_value(data).unwrap_or(Value::Null),
                timestamp: 0.0,
            }),
        },
    }
}

fn console_from_cache(console: &SessionConsole) -> CellOutput {
    match console {
        SessionConsole::StreamMedia { mimetype, data, .. } => CellOutput {
            channel: CellChannel::Media,
            mimetype: mimetype.clone(),
            data: Value::String(data.clone()),
            timestamp: 0.0,
        },
        SessionConsole::Stream { name, text } => CellOutput {
            channel: match name {
                StreamName::Stderr => CellChannel::Stderr,
                StreamName::Stdout => CellChannel::Stdout,
            },
            mimetype: "text/plain".into(),
            data: Value::String(text.clone()),
            timestamp: 0.0,
        },
    }
}

/// Rebuild a view from a cache document. Every restored cell is idle.
#[must_use]
pub fn deserialize_session(session: &NotebookSession) -> SessionView {
    let mut view = SessionView::new();
    for cell in &session.cells {
        let outputs: Vec<CellOutput> = cell.outputs.iter().filter_map(output_from_cache).collect();
        let mut op = CellOp::new(cell.id.clone());
        op.status = Some(RuntimeState::Idle);
        op.output = outputs.into_iter().next();
        op.console = Some(cell.console.iter().map(console_from_cache).collect());
        view.restore_cell_op(op);
    }
    view
}

/// Export code, hashes, names and configs in document order.
#[must_use]
pub fn serialize_notebook(view: &SessionView, cells: &[CellData]) -> NotebookExport {
    NotebookExport {
        version: SESSION_SCHEMA_VERSION.into(),
        metadata: SessionMetadata {
            marimo_version: Some(SERVER_VERSION.into()),
        },
        cells: cells
            .iter()
            .map(|cell| {
                let code = view
                    .last_executed_code()
                    .get(&cell.cell_id)
                    .cloned()
                    .unwrap_or_default();
                NotebookCell {
                    id: cell.cell_id.clone(),
                    code_hash: hash_code(Some(&code)),
                    code,
                    name: Some(cell.name.clone()),
                    config: cell.config.clone(),
                }
            })
            .collect(),
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Background task flushing a view to its cache file.
#[derive(Debug)]
pub struct SessionCacheWriter {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SessionCacheWriter {
    /// Spawn the writer.
    ///
    /// Parent directories are created first. Each tick, if the view changed
    /// since the last flush, it is marked flushed and written as pretty
    /// JSON. Any failure is logged and ends the writer for good.
    #[must_use]
    pub fn spawn(view: Arc<Mutex<SessionView>>, path: PathBuf, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let span = info_span!("session_cache_writer", path = %path.display());

        let handle = tokio::spawn(
            async move {
                if let Some(parent) = path.parent() {
                    if let Err(err) = tokio::fs::create_dir_all(parent).await {
                        error!(%err, "failed to create session cache directory");
                        return;
                    }
                }

                loop {
                    if let Err(err) = flush(&view, &path).await {
                        error!(%err, "session cache write failed; writer stopped");
                        break;
                    }
                    tokio::select! {
                        () = token.cancelled() => {
                            debug!("session cache writer shutting down");
                            break;
                        }
                        () = tokio::time::sleep(interval) => {}
                    }
                }
            }
            .instrument(span),
        );

        Self { cancel, handle }
    }

    /// Whether the task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the task without waiting for it.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn flush(view: &Mutex<SessionView>, path: &Path) -> Result<()> {
    let document = {
        let mut view = view
            .lock()
            .map_err(|_| AppError::Cache("session view lock poisoned".into()))?;
        if !view.needs_export() {
            return Ok(());
        }
        view.mark_exported();
        serialize_session_view(&view)
    };
    debug!(path = %path.display(), "writing session view to cache");
    let json = serde_json::to_string_pretty(&document)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Owns the cache writer of one session and validates cache documents.
#[derive(Debug)]
pub struct SessionCacheManager {
    view: Arc<Mutex<SessionView>>,
    path: Option<PathBuf>,
    interval: Duration,
    writer: Option<SessionCacheWriter>,
}

impl SessionCacheManager {
    /// Manage the cache of the notebook at `path`; `None` for unnamed notebooks.
    #[must_use]
    pub fn new(view: Arc<Mutex<SessionView>>, path: Option<PathBuf>, interval: Duration) -> Self {
        Self {
            view,
            path,
            interval,
            writer: None,
        }
    }

    /// Notebook path, if named.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Start writing. Does nothing for unnamed notebooks.
    pub fn start(&mut self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Some(writer) = self.writer.take() {
            writer.stop();
        }
        self.writer = Some(SessionCacheWriter::spawn(
            Arc::clone(&self.view),
            get_session_cache_file(path),
            self.interval,
        ));
    }

    /// Stop writing. Returns whether a writer was running.
    pub fn stop(&mut self) -> bool {
        match self.writer.take() {
            Some(writer) => {
                writer.stop();
                true
            }
            None => false,
        }
    }

    /// Whether a writer exists and is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.writer.as_ref().is_some_and(SessionCacheWriter::is_running)
    }

    /// Point the cache at a renamed notebook.
    pub fn rename_path(&mut self, new_path: PathBuf) {
        self.stop();
        self.path = Some(new_path);
        self.start();
    }

    /// Whether `session` can stand in for a fresh run keyed by `key`.
    #[must_use]
    pub fn is_cache_hit(session: &NotebookSession, key: &SessionCacheKey) -> bool {
        if key.codes.len() != session.cells.len() {
            return false;
        }
        let hashes_match = key
            .codes
            .iter()
            .zip(&session.cells)
            .all(|(code, cell)| hash_code(code.as_deref()) == cell.code_hash);
        hashes_match && session.metadata.marimo_version.as_deref() == Some(key.version.as_str())
    }

    /// Replace the view from the cache file on a hit.
    ///
    /// Returns `true` on a hit. A missing, unreadable or stale file leaves
    /// the in-memory view untouched.
    pub fn read_session_view(&self, key: &SessionCacheKey) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let cache_file = get_session_cache_file(path);
        let raw = match std::fs::read_to_string(&cache_file) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return false,
            Err(err) => {
                warn!(path = %cache_file.display(), %err, "failed to read session cache");
                return false;
            }
        };
        let session: NotebookSession = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(err) => {
                warn!(path = %cache_file.display(), %err, "failed to parse session cache");
                return false;
            }
        };

        if !Self::is_cache_hit(&session, key) {
            info!(path = %cache_file.display(), "session view cache miss");
            return false;
        }

        let mut restored = deserialize_session(&session);
        for (cell, code) in session.cells.iter().zip(&key.codes) {
            if let Some(code) = code.as_ref().filter(|code| !code.is_empty()) {
                restored.set_last_executed_code(cell.id.clone(), code.clone());
            }
        }
        restored.set_cell_ids(session.cells.iter().map(|cell| cell.id.clone()).collect());
        restored.mark_exported();

        match self.view.lock() {
            Ok(mut view) => {
                *view = restored;
                info!(path = %cache_file.display(), "session view restored from cache");
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for SessionCacheManager {
    fn drop(&mut self) {
        self.stop();
    }
}
