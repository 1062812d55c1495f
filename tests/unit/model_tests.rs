//! Unit tests for kernel messages and requests on the wire.

use serde_json::json;

use notebook_sessions::models::ops::{CellOp, KernelMessage, MessageOperation, RuntimeState};
use notebook_sessions::models::requests::{ControlRequest, ExecuteMultipleRequest, InstantiateRequest};

#[test]
fn kernel_message_parses_from_a_line() {
    let message =
        KernelMessage::from_line(r#"{"op":"cell-op","data":{"cell_id":"a","status":"queued"}}"#)
            .unwrap();
    match message.to_operation() {
        Some(MessageOperation::CellOp(op)) => {
            assert_eq!(op.cell_id, "a");
            assert_eq!(op.status, Some(RuntimeState::Queued));
        }
        other => panic!("expected cell-op, got {other:?}"),
    }
    assert!(KernelMessage::from_line("not json").is_err());
}

#[test]
fn unknown_ops_have_no_typed_form() {
    let message = KernelMessage {
        op: "plugin-event".into(),
        data: json!({}),
    };
    assert!(message.to_operation().is_none());
}

#[test]
fn unit_operations_accept_missing_data() {
    let message = KernelMessage::from_line(r#"{"op":"completed-run"}"#).unwrap();
    assert_eq!(message.to_operation(), Some(MessageOperation::CompletedRun {}));
}

#[test]
fn typed_operation_becomes_op_and_data() {
    let message = KernelMessage::from(MessageOperation::FocusCell {
        cell_id: "c".into(),
    });
    assert_eq!(message.op, "focus-cell");
    assert_eq!(message.data, json!({ "cell_id": "c" }));
}

#[test]
fn console_may_be_a_single_entry() {
    let op: CellOp = serde_json::from_value(json!({
        "cell_id": "a",
        "console": { "channel": "stdout", "mimetype": "text/plain", "data": "hi" }
    }))
    .unwrap();
    assert_eq!(op.console.unwrap().len(), 1);
}

#[test]
fn control_requests_are_tagged_by_type() {
    let request = ControlRequest::ExecuteMultiple(ExecuteMultipleRequest {
        cell_ids: vec!["a".into()],
        codes: vec!["x = 1".into()],
        request: None,
    });
    let value = serde_json::to_value(&request).unwrap();
    assert_eq!(value["type"], "execute-multiple");
    assert_eq!(request.kind(), "execute-multiple");
    assert_eq!(serde_json::to_value(ControlRequest::Stop).unwrap(), json!({ "type": "stop" }));
}

#[test]
fn instantiate_runs_cells_by_default() {
    let request: InstantiateRequest = serde_json::from_value(json!({})).unwrap();
    assert!(request.auto_run);
    assert!(request.object_ids.is_empty());
}
