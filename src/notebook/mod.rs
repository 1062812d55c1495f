//! Notebook files as seen by sessions.
//!
//! Sessions never parse notebook source themselves. They go through an
//! [`AppFileManager`], resolved from a client-supplied file key by a
//! [`FileRouter`].

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::requests::CellConfig;
use crate::models::CellId;
use crate::Result;

pub mod router;
pub mod script;

pub use router::{LocalFileRouter, NEW_FILE_PREFIX};
pub use script::CellScriptFileManager;

/// One cell of a notebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellData {
    /// Cell id, stable while the notebook is open.
    pub cell_id: CellId,
    /// Source code.
    pub code: String,
    /// Cell name; `_` when unnamed.
    pub name: String,
    /// Cell configuration.
    pub config: CellConfig,
}

/// Full notebook contents sent by an editor on save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveNotebookRequest {
    /// Cell ids in document order.
    pub cell_ids: Vec<CellId>,
    /// Cell sources, parallel to `cell_ids`.
    pub codes: Vec<String>,
    /// Cell names, parallel to `cell_ids`.
    pub names: Vec<String>,
    /// Cell configs, parallel to `cell_ids`.
    pub configs: Vec<CellConfig>,
    /// Target path; required for unnamed notebooks.
    #[serde(default)]
    pub filename: Option<PathBuf>,
}

/// Access to one notebook file.
pub trait AppFileManager: Send + Sync {
    /// Absolute path of the notebook, `None` while unnamed.
    fn path(&self) -> Option<PathBuf>;

    /// Raw file contents.
    ///
    /// # Errors
    ///
    /// Returns `AppError::FileManager` for unnamed notebooks or unreadable files.
    fn read_file(&self) -> Result<String>;

    /// Write the notebook and return the written text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::FileManager` if the request is inconsistent or the
    /// file cannot be written.
    fn save(&self, request: &SaveNotebookRequest) -> Result<String>;

    /// Move the notebook to `new_path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::FileManager` if the target exists or the move fails.
    fn rename(&self, new_path: &std::path::Path) -> Result<()>;

    /// Re-read the file; returns ids of cells whose code changed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::FileManager` if the file cannot be read or parsed.
    /// The in-memory notebook is unchanged on error.
    fn reload(&self) -> Result<BTreeSet<CellId>>;

    /// Every cell, in document order.
    fn cell_data(&self) -> Vec<CellData>;

    /// Notebook-level configuration.
    fn app_config(&self) -> Value;

    /// Per-script overrides of the user configuration.
    fn script_config(&self) -> Value;
}

/// Resolves file keys to file managers.
pub trait FileRouter: Send + Sync {
    /// File manager for `key`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no notebook exists for `key`, or
    /// `AppError::BadRequest` if `key` is not acceptable.
    fn get_file_manager(&self, key: &str) -> Result<Arc<dyn AppFileManager>>;

    /// Absolute path a key refers to, without loading it.
    fn resolve_path(&self, key: &str) -> Option<PathBuf>;
}

/// Merge `overrides` into `base`, recursing into nested objects.
#[must_use]
pub fn merge_config(base: Value, overrides: Value) -> Value {
    match (base, overrides) {
        (Value::Object(mut base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_config(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, overrides) => overrides,
    }
}
