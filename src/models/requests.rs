//! Requests sent from sessions to kernels, and the metadata kernels start with.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::CellId;

/// Per-cell configuration stored in the notebook file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellConfig {
    /// Column index in a multi-column layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// Whether the cell is disabled.
    #[serde(default)]
    pub disabled: bool,
    /// Whether the cell's code is hidden.
    #[serde(default)]
    pub hide_code: bool,
}

/// The HTTP request that triggered a kernel action, forwarded for user code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Full request URL.
    #[serde(default)]
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Parsed query parameters.
    #[serde(default)]
    pub query_params: BTreeMap<String, Vec<String>>,
    /// Request cookies.
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

/// Run one cell with the given code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Target cell.
    pub cell_id: CellId,
    /// Source to run.
    pub code: String,
    /// Triggering HTTP request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequest>,
}

/// Run several cells; `cell_ids` and `codes` are parallel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteMultipleRequest {
    /// Target cells.
    pub cell_ids: Vec<CellId>,
    /// Sources, one per cell.
    pub codes: Vec<String>,
    /// Triggering HTTP request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequest>,
}

impl ExecuteMultipleRequest {
    /// Split into one execution request per cell.
    #[must_use]
    pub fn execution_requests(&self) -> Vec<ExecutionRequest> {
        self.cell_ids
            .iter()
            .zip(&self.codes)
            .map(|(cell_id, code)| ExecutionRequest {
                cell_id: cell_id.clone(),
                code: code.clone(),
                request: self.request.clone(),
            })
            .collect()
    }
}

/// New values for UI elements; `object_ids` and `values` are parallel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetUiElementValueRequest {
    /// Element ids.
    pub object_ids: Vec<String>,
    /// New values.
    pub values: Vec<Value>,
    /// Unique token used by the kernel to deduplicate batches.
    #[serde(default)]
    pub token: String,
    /// Triggering HTTP request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequest>,
}

impl SetUiElementValueRequest {
    /// Pairs of element id and value.
    pub fn ids_and_values(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.object_ids.iter().zip(&self.values)
    }
}

/// First run of a notebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationRequest {
    /// Every cell of the notebook.
    pub execution_requests: Vec<ExecutionRequest>,
    /// Initial UI element values.
    pub set_ui_element_value_request: SetUiElementValueRequest,
    /// Whether cells run immediately.
    pub auto_run: bool,
    /// Triggering HTTP request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequest>,
}

/// Remove a cell from the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteCellRequest {
    /// Cell to delete.
    pub cell_id: CellId,
}

/// Run every stale cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteStaleRequest {
    /// Triggering HTTP request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequest>,
}

/// Notify the kernel that the notebook file was renamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRequest {
    /// New file name.
    pub filename: String,
}

/// Requests carried by the control queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Run several cells.
    ExecuteMultiple(ExecuteMultipleRequest),
    /// Update UI element values.
    SetUiElementValue(SetUiElementValueRequest),
    /// Instantiate the notebook.
    Instantiate(CreationRequest),
    /// Delete a cell.
    DeleteCell(DeleteCellRequest),
    /// Run stale cells.
    ExecuteStale(ExecuteStaleRequest),
    /// File renamed.
    Rename(RenameRequest),
    /// Shut the kernel down.
    Stop,
}

impl ControlRequest {
    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecuteMultiple(_) => "execute-multiple",
            Self::SetUiElementValue(_) => "set-ui-element-value",
            Self::Instantiate(_) => "instantiate",
            Self::DeleteCell(_) => "delete-cell",
            Self::ExecuteStale(_) => "execute-stale",
            Self::Rename(_) => "rename",
            Self::Stop => "stop",
        }
    }
}

/// Ask the kernel for code completions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCompletionRequest {
    /// Correlation id echoed in the result.
    pub id: String,
    /// Document text up to the cursor.
    pub document: String,
    /// Cell being edited.
    pub cell_id: CellId,
}

/// Client-facing instantiate payload; turned into a [`CreationRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantiateRequest {
    /// UI element ids with initial values.
    #[serde(default)]
    pub object_ids: Vec<String>,
    /// Initial values, parallel to `object_ids`.
    #[serde(default)]
    pub values: Vec<Value>,
    /// Whether cells run immediately.
    #[serde(default = "default_auto_run")]
    pub auto_run: bool,
}

fn default_auto_run() -> bool {
    true
}

/// Application metadata handed to a kernel at launch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Query parameters of the connecting client.
    #[serde(default)]
    pub query_params: BTreeMap<String, Vec<String>>,
    /// Notebook file path, if the notebook is file-backed.
    #[serde(default)]
    pub filename: Option<String>,
    /// Arguments given to the server after `--`.
    #[serde(default)]
    pub cli_args: BTreeMap<String, Value>,
    /// Raw argument vector for the notebook.
    #[serde(default)]
    pub argv: Vec<String>,
    /// Notebook-level configuration.
    #[serde(default)]
    pub app_config: Value,
}
