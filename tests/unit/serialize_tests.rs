//! Unit tests for the session view cache.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use notebook_sessions::models::ops::{CellChannel, CellOp, CellOutput, MessageOperation, RuntimeState};
use notebook_sessions::models::requests::CellConfig;
use notebook_sessions::notebook::CellData;
use notebook_sessions::session::serialize::{
    deserialize_session, get_session_cache_file, hash_code, serialize_notebook,
    serialize_session_view, SessionCacheKey, SessionCacheManager, SessionCacheWriter,
    SessionConsole, SessionOutput, SERVER_VERSION,
};
use notebook_sessions::session::SessionView;

/// View of a two-cell notebook `x = 1` / `y = x + 1` after one run.
fn ran_view() -> SessionView {
    let mut view = SessionView::new();
    view.set_cell_ids(vec!["a".into(), "b".into()]);
    for (cell_id, code, value) in [("a", "x = 1", "1"), ("b", "y = x + 1", "2")] {
        let mut op = CellOp::new(cell_id);
        op.status = Some(RuntimeState::Idle);
        op.output = Some(CellOutput {
            channel: CellChannel::Output,
            mimetype: "text/plain".into(),
            data: json!(value),
            timestamp: 0.0,
        });
        op.console = Some(vec![CellOutput {
            channel: CellChannel::Stderr,
            mimetype: "text/plain".into(),
            data: json!("warn"),
            timestamp: 0.0,
        }]);
        view.add_operation(&MessageOperation::CellOp(op));
        view.set_last_executed_code(cell_id.into(), code.into());
    }
    view
}

fn key(codes: &[&str], version: &str) -> SessionCacheKey {
    SessionCacheKey {
        codes: codes.iter().map(|code| Some((*code).to_owned())).collect(),
        version: version.to_owned(),
    }
}

#[test]
fn identical_code_and_version_is_a_hit() {
    let document = serialize_session_view(&ran_view());
    assert!(SessionCacheManager::is_cache_hit(
        &document,
        &key(&["x = 1", "y = x + 1"], SERVER_VERSION)
    ));
}

#[test]
fn edited_code_is_a_miss() {
    let document = serialize_session_view(&ran_view());
    assert!(!SessionCacheManager::is_cache_hit(
        &document,
        &key(&["x = 2", "y = x + 1"], SERVER_VERSION)
    ));
}

#[test]
fn other_version_or_cell_count_is_a_miss() {
    let document = serialize_session_view(&ran_view());
    assert!(!SessionCacheManager::is_cache_hit(
        &document,
        &key(&["x = 1", "y = x + 1"], "0.0.0-other")
    ));
    assert!(!SessionCacheManager::is_cache_hit(
        &document,
        &key(&["x = 1"], SERVER_VERSION)
    ));
}

#[test]
fn serialized_cells_carry_hash_outputs_and_console() {
    let document = serialize_session_view(&ran_view());
    assert_eq!(document.cells.len(), 2);
    let first = &document.cells[0];
    assert_eq!(first.id, "a");
    assert_eq!(first.code_hash, hash_code(Some("x = 1")));
    assert!(matches!(&first.outputs[..], [SessionOutput::Data { data }] if data["text/plain"] == json!("1")));
    assert!(matches!(&first.console[..], [SessionConsole::Stream { text, .. }] if text == "warn"));
}

#[test]
fn error_outputs_are_normalized() {
    let mut view = SessionView::new();
    let mut op = CellOp::new("a");
    op.output = Some(CellOutput {
        channel: CellChannel::MarimoError,
        mimetype: "application/vnd.marimo+error".into(),
        data: json!([{ "type": "exception", "msg": "boom" }]),
        timestamp: 0.0,
    });
    view.add_operation(&MessageOperation::CellOp(op));

    let document = serialize_session_view(&view);
    match &document.cells[0].outputs[..] {
        [SessionOutput::Error { ename, evalue, .. }] => {
            assert_eq!(ename, "exception");
            assert_eq!(evalue, "boom");
        }
        other => panic!("expected one error output, got {other:?}"),
    }
}

#[test]
fn deserialized_cells_are_idle() {
    let mut view = ran_view();
    let mut running = CellOp::new("a");
    running.status = Some(RuntimeState::Running);
    view.add_operation(&MessageOperation::CellOp(running));

    let restored = deserialize_session(&serialize_session_view(&view));
    let a = restored.cell_operation("a").unwrap();
    assert_eq!(a.status, Some(RuntimeState::Idle));
    assert_eq!(a.output.as_ref().unwrap().data, json!("1"));
    assert_eq!(a.console.as_ref().unwrap()[0].channel, CellChannel::Stderr);
}

#[test]
fn notebook_export_uses_last_executed_code() {
    let cells = vec![CellData {
        cell_id: "a".into(),
        code: "x = 1".into(),
        name: "setup".into(),
        config: CellConfig::default(),
    }];
    let export = serialize_notebook(&ran_view(), &cells);
    assert_eq!(export.cells[0].code, "x = 1");
    assert_eq!(export.cells[0].code_hash, hash_code(Some("x = 1")));
    assert_eq!(export.cells[0].name.as_deref(), Some("setup"));
}

#[test]
fn read_session_view_restores_on_hit_only() {
    let dir = tempfile::tempdir().unwrap();
    let notebook = dir.path().join("nb.py");
    std::fs::write(&notebook, "# %%\nx = 1\n# %%\ny = x + 1\n").unwrap();
    let cache_file = get_session_cache_file(&notebook);
    std::fs::create_dir_all(cache_file.parent().unwrap()).unwrap();
    std::fs::write(
        &cache_file,
        serde_json::to_string(&serialize_session_view(&ran_view())).unwrap(),
    )
    .unwrap();

    let view = Arc::new(Mutex::new(SessionView::new()));
    let manager = SessionCacheManager::new(
        Arc::clone(&view),
        Some(notebook.clone()),
        Duration::from_secs(1),
    );

    assert!(!manager.read_session_view(&key(&["x = 2", "y = x + 1"], SERVER_VERSION)));
    assert!(view.lock().unwrap().cell_operations().is_empty());

    assert!(manager.read_session_view(&key(&["x = 1", "y = x + 1"], SERVER_VERSION)));
    let restored = view.lock().unwrap();
    assert_eq!(restored.last_executed_code()["b"], "y = x + 1");
    assert_eq!(restored.cell_ids().unwrap(), ["a".to_owned(), "b".to_owned()]);
    assert!(!restored.needs_export());
}

#[test]
fn missing_or_corrupt_cache_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let notebook = dir.path().join("nb.py");
    let view = Arc::new(Mutex::new(SessionView::new()));
    let manager = SessionCacheManager::new(Arc::clone(&view), Some(notebook.clone()), Duration::from_secs(1));
    let wanted = key(&["x = 1"], SERVER_VERSION);

    assert!(!manager.read_session_view(&wanted));

    let cache_file = get_session_cache_file(&notebook);
    std::fs::create_dir_all(cache_file.parent().unwrap()).unwrap();
    std::fs::write(&cache_file, "{ not json").unwrap();
    assert!(!manager.read_session_view(&wanted));

    let unnamed = SessionCacheManager::new(view, None, Duration::from_secs(1));
    assert!(!unnamed.read_session_view(&wanted));
}

#[tokio::test]
async fn writer_flushes_changed_view_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cache_file = get_session_cache_file(&dir.path().join("nb.py"));
    let view = Arc::new(Mutex::new(ran_view()));

    let writer = SessionCacheWriter::spawn(
        Arc::clone(&view),
        cache_file.clone(),
        Duration::from_millis(20),
    );
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cache_file.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cache file should be written");
    writer.stop();

    assert!(!view.lock().unwrap().needs_export());
    // The file may be observed mid-write; wait for a complete document.
    let document = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(raw) = std::fs::read_to_string(&cache_file) {
                if let Ok(document) = serde_json::from_str::<serde_json::Value>(&raw) {
                    return document;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(document["cells"].as_array().unwrap().len(), 2);
    assert_eq!(document["metadata"]["marimo_version"], SERVER_VERSION);
}
