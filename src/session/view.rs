//! Latest known state of a session, used for replay and persistence.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::models::ops::{CellOp, KernelMessage, MessageOperation, VariableDeclaration, VariableValue};
use crate::models::requests::ControlRequest;
use crate::models::CellId;

/// Snapshot of cell outputs, code and UI state for one session.
///
/// Kernel messages are folded in with [`SessionView::add_raw_operation`];
/// requests sent to the kernel with [`SessionView::add_control_request`].
/// Every change bumps a revision counter that the cache writer compares
/// against the last exported revision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    cell_operations: BTreeMap<CellId, CellOp>,
    seen_order: Vec<CellId>,
    cell_ids: Option<Vec<CellId>>,
    last_executed_code: BTreeMap<CellId, String>,
    ui_values: BTreeMap<String, Value>,
    stdin: Vec<String>,
    variables: Option<Vec<VariableDeclaration>>,
    variable_values: BTreeMap<String, VariableValue>,
    revision: u64,
    exported_revision: u64,
}

impl SessionView {
    /// An empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a kernel message into the view. Unknown operations are ignored.
    pub fn add_raw_operation(&mut self, message: &KernelMessage) {
        if let Some(operation) = message.to_operation() {
            self.add_operation(&operation);
        }
    }

    /// Fold a typed operation into the view.
    pub fn add_operation(&mut self, operation: &MessageOperation) {
        match operation {
            MessageOperation::CellOp(op) => self.merge_cell_op(op),
            MessageOperation::UpdateCellIds { cell_ids } => self.set_cell_ids(cell_ids.clone()),
            MessageOperation::Variables { variables } => {
                self.variable_values
                    .retain(|name, _| variables.iter().any(|var| &var.name == name));
                self.variables = Some(variables.clone());
                self.touch();
            }
            MessageOperation::VariableValues { variables } => {
                for value in variables {
                    self.variable_values.insert(value.name.clone(), value.clone());
                }
                self.touch();
            }
            MessageOperation::UpdateCellCodes { .. }
            | MessageOperation::FocusCell { .. }
            | MessageOperation::Reload {}
            | MessageOperation::Reconnected {}
            | MessageOperation::Interrupted {}
            | MessageOperation::CompletedRun {}
            | MessageOperation::KernelReady(_)
            | MessageOperation::Alert { .. }
            | MessageOperation::Banner { .. }
            | MessageOperation::RemoveUiElements { .. }
            | MessageOperation::CompletionResult { .. } => {}
        }
    }

    /// Record a request sent to the kernel.
    pub fn add_control_request(&mut self, request: &ControlRequest) {
        match request {
            ControlRequest::ExecuteMultiple(execute) => {
                for (cell_id, code) in execute.cell_ids.iter().zip(&execute.codes) {
                    self.last_executed_code.insert(cell_id.clone(), code.clone());
                }
            }
            ControlRequest::SetUiElementValue(set) => {
                for (id, value) in set.ids_and_values() {
                    self.ui_values.insert(id.clone(), value.clone());
                }
            }
            ControlRequest::Instantiate(creation) => {
                for execution in &creation.execution_requests {
                    self.last_executed_code
                        .insert(execution.cell_id.clone(), execution.code.clone());
                }
                for (id, value) in creation.set_ui_element_value_request.ids_and_values() {
                    self.ui_values.insert(id.clone(), value.clone());
                }
            }
            ControlRequest::DeleteCell(delete) => {
                self.cell_operations.remove(&delete.cell_id);
                self.seen_order.retain(|id| id != &delete.cell_id);
                self.last_executed_code.remove(&delete.cell_id);
            }
            ControlRequest::ExecuteStale(_) | ControlRequest::Rename(_) | ControlRequest::Stop => {
                return;
            }
        }
        self.touch();
    }

    /// Record an answer typed into a stdin prompt.
    pub fn add_stdin(&mut self, text: String) {
        self.stdin.push(text);
        self.touch();
    }

    /// Set the notebook's cell order, dropping state of cells that no
    /// longer exist.
    pub fn set_cell_ids(&mut self, cell_ids: Vec<CellId>) {
        self.cell_operations
            .retain(|id, _| cell_ids.iter().any(|cell| cell == id));
        self.seen_order.retain(|id| cell_ids.contains(id));
        self.cell_ids = Some(cell_ids);
        self.touch();
    }

    /// Set the code last run in `cell_id`.
    pub fn set_last_executed_code(&mut self, cell_id: CellId, code: String) {
        self.last_executed_code.insert(cell_id, code);
        self.touch();
    }

    fn merge_cell_op(&mut self, op: &CellOp) {
        match self.cell_operations.get_mut(&op.cell_id) {
            Some(previous) => previous.merge(op),
            None => {
                debug!(cell_id = %op.cell_id, "first operation for cell");
                self.seen_order.push(op.cell_id.clone());
                self.cell_operations.insert(op.cell_id.clone(), op.clone());
            }
        }
        self.touch();
    }

    /// Insert a cell state verbatim, as restored from the cache.
    pub(crate) fn restore_cell_op(&mut self, op: CellOp) {
        if !self.cell_operations.contains_key(&op.cell_id) {
            self.seen_order.push(op.cell_id.clone());
        }
        self.cell_operations.insert(op.cell_id.clone(), op);
        self.touch();
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    /// Whether the view changed since the last export.
    #[must_use]
    pub fn needs_export(&self) -> bool {
        self.revision != self.exported_revision
    }

    /// Mark the current revision as exported.
    pub fn mark_exported(&mut self) {
        self.exported_revision = self.revision;
    }

    /// Latest state of `cell_id`.
    #[must_use]
    pub fn cell_operation(&self, cell_id: &str) -> Option<&CellOp> {
        self.cell_operations.get(cell_id)
    }

    /// Every cell with state, keyed by id.
    #[must_use]
    pub fn cell_operations(&self) -> &BTreeMap<CellId, CellOp> {
        &self.cell_operations
    }

    /// Notebook order if known, else the order cells were first seen.
    #[must_use]
    pub fn ordered_cell_ids(&self) -> Vec<CellId> {
        self.cell_ids
            .clone()
            .unwrap_or_else(|| self.seen_order.clone())
    }

    /// Notebook order as reported by `update-cell-ids`, if any.
    #[must_use]
    pub fn cell_ids(&self) -> Option<&[CellId]> {
        self.cell_ids.as_deref()
    }

    /// Code last run per cell.
    #[must_use]
    pub fn last_executed_code(&self) -> &BTreeMap<CellId, String> {
        &self.last_executed_code
    }

    /// Latest value of every UI element that was set.
    #[must_use]
    pub fn ui_values(&self) -> &BTreeMap<String, Value> {
        &self.ui_values
    }

    /// Every stdin answer, oldest first.
    #[must_use]
    pub fn stdin(&self) -> &[String] {
        &self.stdin
    }

    /// Operations that rebuild this view for a consumer that just attached.
    #[must_use]
    pub fn operations(&self) -> Vec<MessageOperation> {
        let mut operations = Vec::new();
        if let Some(variables) = &self.variables {
            operations.push(MessageOperation::Variables {
                variables: variables.clone(),
            });
        }
        if !self.variable_values.is_empty() {
            operations.push(MessageOperation::VariableValues {
                variables: self.variable_values.values().cloned().collect(),
            });
        }
        for cell_id in self.ordered_cell_ids() {
            if let Some(op) = self.cell_operations.get(&cell_id) {
                operations.push(MessageOperation::CellOp(op.clone()));
            }
        }
        operations
    }
}
