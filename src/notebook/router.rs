//! File keys to file managers.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::notebook::{AppFileManager, CellScriptFileManager, FileRouter};
use crate::{AppError, Result};

/// Keys starting with this prefix denote a new, unnamed notebook.
pub const NEW_FILE_PREFIX: &str = "__new__";

/// Resolves keys relative to a directory, or to a single fixed file.
#[derive(Debug, Clone)]
pub struct LocalFileRouter {
    root: PathBuf,
    single_file: Option<PathBuf>,
}

impl LocalFileRouter {
    /// Serve any notebook under `root`.
    #[must_use]
    pub fn directory(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            single_file: None,
        }
    }

    /// Serve only `file`; every non-new key resolves to it.
    #[must_use]
    pub fn single_file(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let root = file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self {
            root,
            single_file: Some(file),
        }
    }

    /// Path for `key`, which must stay inside the root once symlinks are
    /// resolved.
    fn absolute(&self, key: &str) -> Result<PathBuf> {
        if let Some(file) = &self.single_file {
            return Ok(std::fs::canonicalize(file).unwrap_or_else(|_| file.clone()));
        }

        let escapes =
            || AppError::BadRequest(format!("file key escapes the notebook directory: {key}"));
        let relative = Path::new(key);
        if relative
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(escapes());
        }

        let root = std::fs::canonicalize(&self.root).map_err(|err| {
            AppError::NotFound(format!(
                "notebook directory {} unavailable: {err}",
                self.root.display()
            ))
        })?;
        let joined = if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            root.join(relative)
        };
        let resolved = std::fs::canonicalize(&joined).unwrap_or(joined);
        if !resolved.starts_with(&root) {
            return Err(escapes());
        }
        Ok(resolved)
    }
}

impl FileRouter for LocalFileRouter {
    fn get_file_manager(&self, key: &str) -> Result<Arc<dyn AppFileManager>> {
        if key.starts_with(NEW_FILE_PREFIX) {
            return Ok(Arc::new(CellScriptFileManager::unnamed()));
        }
        let path = self.absolute(key)?;
        if !path.is_file() {
            return Err(AppError::NotFound(format!(
                "notebook not found: {}",
                path.display()
            )));
        }
        Ok(Arc::new(CellScriptFileManager::open(path)?))
    }

    fn resolve_path(&self, key: &str) -> Option<PathBuf> {
        if key.starts_with(NEW_FILE_PREFIX) {
            return None;
        }
        self.absolute(key).ok()
    }
}
