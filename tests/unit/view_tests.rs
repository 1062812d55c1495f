//! Unit tests for `SessionView` folding and replay.

use serde_json::json;

use notebook_sessions::models::ops::{
    CellChannel, CellOp, CellOutput, KernelMessage, MessageOperation, RuntimeState,
    VariableDeclaration,
};
use notebook_sessions::models::requests::{
    ControlRequest, DeleteCellRequest, ExecuteMultipleRequest, SetUiElementValueRequest,
};
use notebook_sessions::session::SessionView;

fn stdout(text: &str) -> CellOutput {
    CellOutput {
        channel: CellChannel::Stdout,
        mimetype: "text/plain".into(),
        data: json!(text),
        timestamp: 0.0,
    }
}

fn cell_op(cell_id: &str) -> CellOp {
    CellOp::new(cell_id)
}

#[test]
fn console_accumulates_until_the_cell_is_queued() {
    let mut view = SessionView::new();
    let mut first = cell_op("c1");
    first.console = Some(vec![stdout("a")]);
    let mut second = cell_op("c1");
    second.console = Some(vec![stdout("b")]);
    view.add_operation(&MessageOperation::CellOp(first));
    view.add_operation(&MessageOperation::CellOp(second));
    assert_eq!(view.cell_operation("c1").unwrap().console.as_ref().unwrap().len(), 2);

    let mut queued = cell_op("c1");
    queued.status = Some(RuntimeState::Queued);
    view.add_operation(&MessageOperation::CellOp(queued));

    let state = view.cell_operation("c1").unwrap();
    assert_eq!(state.status, Some(RuntimeState::Queued));
    assert!(state.console.as_ref().unwrap().is_empty());
}

#[test]
fn raw_messages_fold_like_typed_ones_and_unknown_ops_are_ignored() {
    let mut view = SessionView::new();
    view.add_raw_operation(&KernelMessage {
        op: "cell-op".into(),
        data: json!({ "cell_id": "c1", "status": "running" }),
    });
    view.mark_exported();

    view.add_raw_operation(&KernelMessage {
        op: "something-new".into(),
        data: json!({ "x": 1 }),
    });

    assert_eq!(
        view.cell_operation("c1").unwrap().status,
        Some(RuntimeState::Running)
    );
    assert!(!view.needs_export());
}

#[test]
fn new_cell_order_drops_removed_cells() {
    let mut view = SessionView::new();
    view.add_operation(&MessageOperation::CellOp(cell_op("a")));
    view.add_operation(&MessageOperation::CellOp(cell_op("b")));

    view.add_operation(&MessageOperation::UpdateCellIds {
        cell_ids: vec!["b".into(), "c".into()],
    });

    assert!(view.cell_operation("a").is_none());
    assert!(view.cell_operation("b").is_some());
    assert_eq!(view.ordered_cell_ids(), vec!["b".to_owned(), "c".to_owned()]);
}

#[test]
fn control_requests_record_code_and_ui_values() {
    let mut view = SessionView::new();
    view.add_control_request(&ControlRequest::ExecuteMultiple(ExecuteMultipleRequest {
        cell_ids: vec!["a".into(), "b".into()],
        codes: vec!["x = 1".into(), "y = x".into()],
        request: None,
    }));
    view.add_control_request(&ControlRequest::SetUiElementValue(SetUiElementValueRequest {
        object_ids: vec!["slider".into()],
        values: vec![json!(3)],
        token: "t".into(),
        request: None,
    }));

    assert_eq!(view.last_executed_code()["a"], "x = 1");
    assert_eq!(view.last_executed_code()["b"], "y = x");
    assert_eq!(view.ui_values()["slider"], json!(3));

    view.add_operation(&MessageOperation::CellOp(cell_op("a")));
    view.add_control_request(&ControlRequest::DeleteCell(DeleteCellRequest {
        cell_id: "a".into(),
    }));
    assert!(view.cell_operation("a").is_none());
    assert!(!view.last_executed_code().contains_key("a"));
}

#[test]
fn stop_request_does_not_touch_the_view() {
    let mut view = SessionView::new();
    view.add_control_request(&ControlRequest::Stop);
    assert!(!view.needs_export());
}

#[test]
fn replay_lists_variables_then_cells_in_notebook_order() {
    let mut view = SessionView::new();
    view.set_cell_ids(vec!["b".into(), "a".into()]);
    view.add_operation(&MessageOperation::CellOp(cell_op("a")));
    view.add_operation(&MessageOperation::CellOp(cell_op("b")));
    view.add_operation(&MessageOperation::Variables {
        variables: vec![VariableDeclaration {
            name: "x".into(),
            declared_by: vec!["a".into()],
            used_by: vec!["b".into()],
        }],
    });

    let operations = view.operations();
    let names: Vec<&str> = operations
        .iter()
        .map(|operation| match operation {
            MessageOperation::CellOp(op) => op.cell_id.as_str(),
            other => other.name(),
        })
        .collect();
    assert_eq!(names, vec!["variables", "b", "a"]);
}

#[test]
fn every_change_needs_export_until_marked() {
    let mut view = SessionView::new();
    assert!(!view.needs_export());

    view.add_stdin("answer".into());
    assert!(view.needs_export());
    assert_eq!(view.stdin(), ["answer".to_owned()]);

    view.mark_exported();
    assert!(!view.needs_export());
}
