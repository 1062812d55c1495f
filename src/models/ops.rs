//! Operations exchanged between kernels, sessions and consumers.
//!
//! Every message on the wire is an `{"op": "<name>", "data": {...}}` object.
//! [`KernelMessage`] keeps that shape untouched so unknown operations still
//! reach consumers; [`MessageOperation`] is the typed view of the operations
//! this crate inspects or originates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::models::requests::CellConfig;
use crate::models::{deserialize_one_or_many, CellId};
use crate::{AppError, Result};

/// Output channel of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CellChannel {
    /// Rendered cell output.
    Output,
    /// Error raised while running the cell.
    MarimoError,
    /// Captured standard output.
    Stdout,
    /// Captured standard error.
    Stderr,
    /// Prompt for standard input.
    Stdin,
    /// Rich media written to the console.
    Media,
    /// Debugger session output.
    Pdb,
}

/// One output or console entry of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    /// Channel the entry was written to.
    pub channel: CellChannel,
    /// Mimetype of `data`.
    pub mimetype: String,
    /// Payload; a string for text mimetypes, JSON otherwise.
    pub data: Value,
    /// Seconds since the epoch when the entry was produced.
    #[serde(default)]
    pub timestamp: f64,
}

/// Execution status of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeState {
    /// Not running and not scheduled.
    Idle,
    /// Scheduled for execution.
    Queued,
    /// Currently executing.
    Running,
    /// Disabled because an ancestor is disabled.
    DisabledTransitively,
}

/// Transition of a single cell. Omitted fields leave the cell unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOp {
    /// Target cell.
    pub cell_id: CellId,
    /// Replacement output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<CellOutput>,
    /// Console entries to append; an empty list clears the console.
    #[serde(
        default,
        deserialize_with = "deserialize_one_or_many",
        skip_serializing_if = "Option::is_none"
    )]
    pub console: Option<Vec<CellOutput>>,
    /// New execution status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RuntimeState>,
    /// Whether the cell reads stale inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_inputs: Option<bool>,
    /// Run this transition belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Seconds since the epoch.
    #[serde(default)]
    pub timestamp: f64,
}

impl CellOp {
    /// An empty transition for `cell_id`.
    #[must_use]
    pub fn new(cell_id: impl Into<CellId>) -> Self {
        Self {
            cell_id: cell_id.into(),
            output: None,
            console: None,
            status: None,
            stale_inputs: None,
            run_id: None,
            timestamp: 0.0,
        }
    }

    /// Fold `next` into `self`, the latest known state of the cell.
    ///
    /// Scheduling a cell clears its console; console entries otherwise
    /// accumulate.
    pub fn merge(&mut self, next: &CellOp) {
        if let Some(status) = next.status {
            if status == RuntimeState::Queued {
                self.console = Some(Vec::new());
            }
            self.status = Some(status);
        }
        if let Some(output) = &next.output {
            self.output = Some(output.clone());
        }
        if let Some(console) = &next.console {
            if console.is_empty() {
                self.console = Some(Vec::new());
            } else {
                self.console
                    .get_or_insert_with(Vec::new)
                    .extend(console.iter().cloned());
            }
        }
        if next.stale_inputs.is_some() {
            self.stale_inputs = next.stale_inputs;
        }
        if next.run_id.is_some() {
            self.run_id.clone_from(&next.run_id);
        }
        self.timestamp = next.timestamp;
    }
}

/// A variable and the cells that declare or use it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDeclaration {
    /// Variable name.
    pub name: String,
    /// Cells defining the variable.
    pub declared_by: Vec<CellId>,
    /// Cells reading the variable.
    pub used_by: Vec<CellId>,
}

/// Preview of a variable's current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableValue {
    /// Variable name.
    pub name: String,
    /// Short rendering of the value.
    #[serde(default)]
    pub value: Option<String>,
    /// Type name of the value.
    #[serde(default)]
    pub datatype: Option<String>,
}

/// Notebook snapshot sent to a consumer when it attaches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelReady {
    /// Cell ids in document order.
    pub cell_ids: Vec<CellId>,
    /// Cell sources, parallel to `cell_ids`. Empty when code is withheld.
    pub codes: Vec<String>,
    /// Cell names, parallel to `cell_ids`.
    pub names: Vec<String>,
    /// Cell configs, parallel to `cell_ids`.
    pub configs: Vec<CellConfig>,
    /// Optional layout document.
    #[serde(default)]
    pub layout: Option<Value>,
    /// Whether the consumer attached to an existing session.
    pub resumed: bool,
    /// Current UI element values, on resume.
    #[serde(default)]
    pub ui_values: Option<BTreeMap<String, Value>>,
    /// Code last run per cell, on resume.
    #[serde(default)]
    pub last_executed_code: Option<BTreeMap<CellId, String>>,
    /// Notebook-level configuration.
    pub app_config: Value,
    /// Whether the consumer is a read-only kiosk.
    pub kiosk: bool,
}

/// Typed operations, serialized as `{"op": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "kebab-case")]
pub enum MessageOperation {
    /// Cell transition.
    CellOp(CellOp),
    /// Ask consumers to focus a cell.
    FocusCell {
        /// Cell to focus.
        cell_id: CellId,
    },
    /// New source code for a set of cells.
    UpdateCellCodes {
        /// Cells whose code changed.
        cell_ids: Vec<CellId>,
        /// New code, parallel to `cell_ids`.
        codes: Vec<String>,
        /// True when the code has not been run yet.
        code_is_stale: bool,
    },
    /// New notebook cell order.
    UpdateCellIds {
        /// Cell ids in document order.
        cell_ids: Vec<CellId>,
    },
    /// Ask consumers to reload the notebook.
    Reload {},
    /// Consumer re-attached to a running session.
    Reconnected {},
    /// Kernel acknowledged an interrupt.
    Interrupted {},
    /// Kernel finished a run.
    CompletedRun {},
    /// Notebook snapshot for a newly attached consumer.
    KernelReady(KernelReady),
    /// Transient notification.
    Alert {
        /// Short title.
        title: String,
        /// Body text.
        description: String,
        /// Visual variant, e.g. `danger`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variant: Option<String>,
    },
    /// Persistent notification.
    Banner {
        /// Short title.
        title: String,
        /// Body text.
        description: String,
        /// Visual variant, e.g. `danger`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variant: Option<String>,
        /// Suggested action, e.g. `restart`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },
    /// Variable graph snapshot.
    Variables {
        /// All declared variables.
        variables: Vec<VariableDeclaration>,
    },
    /// Variable value previews.
    VariableValues {
        /// Updated values.
        variables: Vec<VariableValue>,
    },
    /// UI elements owned by a cell were destroyed.
    RemoveUiElements {
        /// Owning cell.
        cell_id: CellId,
    },
    /// Response to a completion request.
    CompletionResult {
        /// Request being answered.
        completion_id: String,
        /// Length of the completed prefix.
        prefix_length: usize,
        /// Completion options.
        options: Vec<Value>,
    },
}

impl MessageOperation {
    /// Wire name of the operation.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CellOp(_) => "cell-op",
            Self::FocusCell { .. } => "focus-cell",
            Self::UpdateCellCodes { .. } => "update-cell-codes",
            Self::UpdateCellIds { .. } => "update-cell-ids",
            Self::Reload {} => "reload",
            Self::Reconnected {} => "reconnected",
            Self::Interrupted {} => "interrupted",
            Self::CompletedRun {} => "completed-run",
            Self::KernelReady(_) => "kernel-ready",
            Self::Alert { .. } => "alert",
            Self::Banner { .. } => "banner",
            Self::Variables { .. } => "variables",
            Self::VariableValues { .. } => "variable-values",
            Self::RemoveUiElements { .. } => "remove-ui-elements",
            Self::CompletionResult { .. } => "completion-result",
        }
    }
}

/// Untyped `{op, data}` message as produced by a kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    /// Operation name.
    pub op: String,
    /// Operation payload.
    #[serde(default)]
    pub data: Value,
}

impl KernelMessage {
    /// Parse one NDJSON line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the line is not a `{op, data}` object.
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|err| AppError::Ipc(format!("malformed message: {err}")))
    }

    /// Typed view of this message, if it is an operation this crate knows.
    #[must_use]
    pub fn to_operation(&self) -> Option<MessageOperation> {
        let data = match &self.data {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        let value = serde_json::json!({ "op": self.op, "data": data });
        match serde_json::from_value(value) {
            Ok(op) => Some(op),
            Err(err) => {
                debug!(op = %self.op, %err, "message has no typed form");
                None
            }
        }
    }
}

impl From<&MessageOperation> for KernelMessage {
    fn from(op: &MessageOperation) -> Self {
        let data = match serde_json::to_value(op) {
            Ok(Value::Object(mut map)) => map.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Self {
            op: op.name().to_owned(),
            data,
        }
    }
}

impl From<MessageOperation> for KernelMessage {
    fn from(op: MessageOperation) -> Self {
        Self::from(&op)
    }
}
