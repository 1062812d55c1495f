//! Notebook file watching.
//!
//! One `notify` watcher per notebook path. The parent directory is watched
//! non-recursively and events are filtered by file name, so editors that
//! save by replacing the file are still seen. A change is reported only
//! when the file's content digest differs from the last one seen.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tracing::{debug, info, info_span, warn};

use crate::{AppError, Result};

/// Invoked with the changed path, on the watcher's own thread.
pub type WatchCallback = Arc<dyn Fn(&Path) + Send + Sync>;

#[derive(Default)]
struct WatchState {
    callbacks: BTreeMap<u64, WatchCallback>,
    digest: Option<String>,
}

struct WatchEntry {
    state: Arc<Mutex<WatchState>>,
    _watcher: RecommendedWatcher,
}

/// Shared file watchers keyed by notebook path.
pub struct FileWatcherManager {
    entries: Mutex<HashMap<PathBuf, WatchEntry>>,
    next_id: AtomicU64,
}

impl fmt::Debug for FileWatcherManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWatcherManager")
            .field("watched", &self.watched_paths())
            .finish_non_exhaustive()
    }
}

impl Default for FileWatcherManager {
    fn default() -> Self {
        Self::new()
    }
}

fn content_digest(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(format!("{:x}", hasher.finalize()))
}

fn is_content_event(event: &Event, file_name: &std::ffi::OsStr) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name))
}

impl FileWatcherManager {
    /// Create a manager with no watchers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `callback` for changes to `path`; returns its registration id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::FileManager` if the watcher cannot be created.
    pub fn add_callback(&self, path: &Path, callback: WatchCallback) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AppError::FileManager("watcher registry lock poisoned".into()))?;

        if let Some(entry) = entries.get(path) {
            if let Ok(mut state) = entry.state.lock() {
                state.callbacks.insert(id, callback);
            }
            return Ok(id);
        }

        let _span = info_span!("file_watch_register", path = %path.display()).entered();
        let state = Arc::new(Mutex::new(WatchState {
            callbacks: BTreeMap::from([(id, callback)]),
            digest: content_digest(path),
        }));
        let watcher = spawn_watcher(path, Arc::clone(&state))?;
        entries.insert(
            path.to_path_buf(),
            WatchEntry {
                state,
                _watcher: watcher,
            },
        );
        info!("watching notebook file");
        Ok(id)
    }

    /// Remove a registration; the watcher goes away with its last callback.
    pub fn remove_callback(&self, path: &Path, id: u64) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let now_empty = entries.get(path).is_some_and(|entry| {
            entry.state.lock().map_or(true, |mut state| {
                state.callbacks.remove(&id);
                state.callbacks.is_empty()
            })
        });
        if now_empty {
            entries.remove(path);
            info!(path = %path.display(), "stopped watching notebook file");
        }
    }

    /// Drop every watcher.
    pub fn stop_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            let count = entries.len();
            entries.clear();
            if count > 0 {
                info!(count, "stopped all file watchers");
            }
        }
    }

    /// Paths currently watched.
    #[must_use]
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.entries
            .lock()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn spawn_watcher(path: &Path, state: Arc<Mutex<WatchState>>) -> Result<RecommendedWatcher> {
    let file_name = path
        .file_name()
        .ok_or_else(|| AppError::FileManager(format!("not a file: {}", path.display())))?
        .to_os_string();
    let parent = path
        .parent()
        .ok_or_else(|| AppError::FileManager(format!("no parent: {}", path.display())))?
        .to_path_buf();
    let target = path.to_path_buf();

    let mut watcher = notify::recommended_watcher(
        move |result: std::result::Result<Event, notify::Error>| match result {
            Ok(event) => {
                if !is_content_event(&event, &file_name) {
                    return;
                }
                let Some(digest) = content_digest(&target) else {
                    return;
                };
                let callbacks: Vec<WatchCallback> = {
                    let Ok(mut state) = state.lock() else {
                        return;
                    };
                    if state.digest.as_deref() == Some(digest.as_str()) {
                        debug!(path = %target.display(), "file event without content change");
                        return;
                    }
                    state.digest = Some(digest);
                    state.callbacks.values().cloned().collect()
                };
                for callback in callbacks {
                    callback(&target);
                }
            }
            Err(err) => {
                warn!(%err, "file watcher error");
            }
        },
    )
    .map_err(|err| AppError::FileManager(format!("failed to create watcher: {err}")))?;

    watcher
        .watch(&parent, RecursiveMode::NonRecursive)
        .map_err(|err| AppError::FileManager(format!("failed to watch directory: {err}")))?;
    Ok(watcher)
}
