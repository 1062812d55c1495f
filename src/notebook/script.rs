//! Cell-script notebooks.
//!
//! A notebook is a plain script split into cells by `# %%` marker lines.
//! The marker may carry a cell name and a JSON cell config:
//!
//! ```text
//! # app: {"width": "medium"}
//! # config: {"runtime": {"auto_instantiate": false}}
//!
//! # %% setup
//! x = 1
//!
//! # %% plot {"hide_code": true}
//! y = x + 1
//! ```
//!
//! Header lines before the first marker hold the notebook (`# app:`) and
//! per-script user (`# config:`) configuration. Cell ids are positional.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, info};

use crate::models::requests::CellConfig;
use crate::models::CellId;
use crate::notebook::{AppFileManager, CellData, SaveNotebookRequest};
use crate::{AppError, Result};

const CELL_MARKER: &str = "# %%";
const APP_HEADER: &str = "# app:";
const CONFIG_HEADER: &str = "# config:";
const UNNAMED_CELL: &str = "_";

#[derive(Debug, Clone, PartialEq)]
struct ParsedScript {
    cells: Vec<CellData>,
    app_config: Value,
    script_config: Value,
}

#[derive(Debug)]
struct ScriptState {
    path: Option<PathBuf>,
    parsed: ParsedScript,
}

/// File manager for `# %%` cell scripts.
#[derive(Debug)]
pub struct CellScriptFileManager {
    state: Mutex<ScriptState>,
}

/// Positional id of the cell at `index`.
#[must_use]
pub fn cell_id_for(index: usize) -> CellId {
    format!("cell-{index}")
}

impl CellScriptFileManager {
    /// Load the notebook at `path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::FileManager` if the file cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = std::fs::canonicalize(path.as_ref()).map_err(|err| {
            AppError::FileManager(format!("cannot open {}: {err}", path.as_ref().display()))
        })?;
        let source = std::fs::read_to_string(&path)
            .map_err(|err| AppError::FileManager(format!("cannot read {}: {err}", path.display())))?;
        let parsed = parse_script(&source)?;
        debug!(path = %path.display(), cells = parsed.cells.len(), "notebook loaded");
        Ok(Self {
            state: Mutex::new(ScriptState {
                path: Some(path),
                parsed,
            }),
        })
    }

    /// A new, unnamed notebook with one empty cell.
    #[must_use]
    pub fn unnamed() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                path: None,
                parsed: ParsedScript {
                    cells: vec![CellData {
                        cell_id: cell_id_for(0),
                        code: String::new(),
                        name: UNNAMED_CELL.into(),
                        config: CellConfig::default(),
                    }],
                    app_config: Value::Object(serde_json::Map::new()),
                    script_config: Value::Object(serde_json::Map::new()),
                },
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AppFileManager for CellScriptFileManager {
    fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    fn read_file(&self) -> Result<String> {
        let path = self
            .path()
            .ok_or_else(|| AppError::FileManager("notebook is unnamed".into()))?;
        std::fs::read_to_string(&path)
            .map_err(|err| AppError::FileManager(format!("cannot read {}: {err}", path.display())))
    }

    fn save(&self, request: &SaveNotebookRequest) -> Result<String> {
        let count = request.cell_ids.len();
        if request.codes.len() != count
            || request.names.len() != count
            || request.configs.len() != count
        {
            return Err(AppError::FileManager(
                "cell ids, codes, names and configs must have the same length".into(),
            ));
        }

        let mut state = self.lock();
        let path = match (&request.filename, &state.path) {
            (Some(filename), _) => filename.clone(),
            (None, Some(path)) => path.clone(),
            (None, None) => {
                return Err(AppError::FileManager(
                    "cannot save an unnamed notebook without a filename".into(),
                ))
            }
        };

        let cells: Vec<CellData> = (0..count)
            .map(|index| CellData {
                cell_id: request.cell_ids[index].clone(),
                code: request.codes[index].clone(),
                name: request.names[index].clone(),
                config: request.configs[index].clone(),
            })
            .collect();
        let parsed = ParsedScript {
            cells,
            app_config: state.parsed.app_config.clone(),
            script_config: state.parsed.script_config.clone(),
        };
        let text = render_script(&parsed);

        std::fs::write(&path, &text)
            .map_err(|err| AppError::FileManager(format!("cannot write {}: {err}", path.display())))?;
        info!(path = %path.display(), cells = count, "notebook saved");

        state.path = Some(path);
        state.parsed = parsed;
        Ok(text)
    }

    fn rename(&self, new_path: &Path) -> Result<()> {
        if new_path.exists() {
            return Err(AppError::FileManager(format!(
                "{} already exists",
                new_path.display()
            )));
        }

        let mut state = self.lock();
        match &state.path {
            Some(old) => std::fs::rename(old, new_path).map_err(|err| {
                AppError::FileManager(format!("cannot rename to {}: {err}", new_path.display()))
            })?,
            None => std::fs::write(new_path, render_script(&state.parsed)).map_err(|err| {
                AppError::FileManager(format!("cannot write {}: {err}", new_path.display()))
            })?,
        }

        let new_path = std::fs::canonicalize(new_path).unwrap_or_else(|_| new_path.to_path_buf());
        info!(path = %new_path.display(), "notebook renamed");
        state.path = Some(new_path);
        Ok(())
    }

    fn reload(&self) -> Result<BTreeSet<CellId>> {
        let source = self.read_file()?;
        let parsed = parse_script(&source)?;

        let mut state = self.lock();
        let changed = parsed
            .cells
            .iter()
            .filter(|cell| {
                !state
                    .parsed
                    .cells
                    .iter()
                    .any(|old| old.cell_id == cell.cell_id && old.code == cell.code)
            })
            .map(|cell| cell.cell_id.clone())
            .collect();
        state.parsed = parsed;
        Ok(changed)
    }

    fn cell_data(&self) -> Vec<CellData> {
        self.lock().parsed.cells.clone()
    }

    fn app_config(&self) -> Value {
        self.lock().parsed.app_config.clone()
    }

    fn script_config(&self) -> Value {
        self.lock().parsed.script_config.clone()
    }
}

fn parse_header_json(line: &str, prefix: &str) -> Result<Value> {
    let raw = line[prefix.len()..].trim();
    serde_json::from_str(raw)
        .map_err(|err| AppError::FileManager(format!("invalid `{prefix}` header: {err}")))
}

fn parse_marker(rest: &str) -> Result<(String, CellConfig)> {
    let rest = rest.trim();
    let (name, config) = match rest.find('{') {
        Some(index) => {
            let config = serde_json::from_str(&rest[index..])
                .map_err(|err| AppError::FileManager(format!("invalid cell config: {err}")))?;
            (rest[..index].trim(), config)
        }
        None => (rest, CellConfig::default()),
    };
    let name = if name.is_empty() { UNNAMED_CELL } else { name };
    Ok((name.to_owned(), config))
}

fn finish_cell(cells: &mut Vec<CellData>, marker: Option<(String, CellConfig)>, lines: &[&str]) {
    let Some((name, config)) = marker else {
        return;
    };
    let code = lines.join("\n").trim_matches('\n').trim_end().to_owned();
    cells.push(CellData {
        cell_id: cell_id_for(cells.len()),
        code,
        name,
        config,
    });
}

fn parse_script(source: &str) -> Result<ParsedScript> {
    let mut app_config = Value::Object(serde_json::Map::new());
    let mut script_config = Value::Object(serde_json::Map::new());
    let mut cells = Vec::new();
    let mut marker: Option<(String, CellConfig)> = None;
    let mut body: Vec<&str> = Vec::new();

    for line in source.lines() {
        if let Some(rest) = line.strip_prefix(CELL_MARKER) {
            finish_cell(&mut cells, marker.take(), &body);
            body.clear();
            marker = Some(parse_marker(rest)?);
        } else if marker.is_some() {
            body.push(line);
        } else if line.starts_with(APP_HEADER) {
            app_config = parse_header_json(line, APP_HEADER)?;
        } else if line.starts_with(CONFIG_HEADER) {
            script_config = parse_header_json(line, CONFIG_HEADER)?;
        }
    }
    finish_cell(&mut cells, marker, &body);

    Ok(ParsedScript {
        cells,
        app_config,
        script_config,
    })
}

fn render_script(parsed: &ParsedScript) -> String {
    let mut out = String::new();
    let is_empty = |value: &Value| value.as_object().map_or(true, serde_json::Map::is_empty);
    if !is_empty(&parsed.app_config) {
        let _ = writeln!(out, "{APP_HEADER} {}", parsed.app_config);
    }
    if !is_empty(&parsed.script_config) {
        let _ = writeln!(out, "{CONFIG_HEADER} {}", parsed.script_config);
    }

    for cell in &parsed.cells {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(CELL_MARKER);
        if cell.name != UNNAMED_CELL {
            out.push(' ');
            out.push_str(&cell.name);
        }
        if cell.config != CellConfig::default() {
            if let Ok(config) = serde_json::to_string(&cell.config) {
                out.push(' ');
                out.push_str(&config);
            }
        }
        out.push('\n');
        if !cell.code.is_empty() {
            out.push_str(&cell.code);
            out.push('\n');
        }
    }
    out
}
