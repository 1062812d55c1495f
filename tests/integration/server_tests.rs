//! Integration tests for the HTTP surface.
//!
//! Validates `/health` and the `/api/kernel/*` endpoints, including their
//! access-token and kiosk checks, against a server bound to an ephemeral
//! port.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use notebook_sessions::server::api::SESSION_ID_HEADER;
use notebook_sessions::server::{serve, AppState};
use notebook_sessions::session::{ConnectionState, ConsumerRole, SessionManager};

use super::test_helpers::{
    as_consumer, edit_config, test_manager, wait_until, write_notebook, EchoLauncher,
    FakeConsumer, NOTEBOOK,
};

struct TestServer {
    base_url: String,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

/// Spawn a server on a free port with one notebook, `nb.py`.
async fn spawn_server(launcher: &EchoLauncher) -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    write_notebook(dir.path(), "nb.py", NOTEBOOK);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);

    let mut config = edit_config();
    config.host = "127.0.0.1".into();
    config.port = port;
    let manager = test_manager(config, dir.path(), launcher);
    let shutdown = CancellationToken::new();
    let state = AppState::new(Arc::clone(&manager), shutdown.clone());
    tokio::spawn(async move {
        let _ = serve(state).await;
    });

    let base_url = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();
    let health_url = format!("{base_url}/health");
    let up = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while client.get(&health_url).send().await.is_err() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(up.is_ok(), "server did not start");

    TestServer {
        base_url,
        manager,
        shutdown,
        _dir: dir,
    }
}

/// Token of every manager built by `test_manager`.
const ACCESS_TOKEN: &str = "secret";

async fn post(server: &TestServer, path: &str, session_id: Option<&str>, body: Value) -> reqwest::Response {
    post_with_token(server, path, session_id, Some(ACCESS_TOKEN), body).await
}

async fn post_with_token(
    server: &TestServer,
    path: &str,
    session_id: Option<&str>,
    token: Option<&str>,
    body: Value,
) -> reqwest::Response {
    let mut request = reqwest::Client::new()
        .post(format!("{}{path}", server.base_url))
        .json(&body);
    if let Some(id) = session_id {
        request = request.header(SESSION_ID_HEADER, id);
    }
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    request.send().await.expect("HTTP POST")
}

#[tokio::test]
async fn health_reports_sessions() {
    let launcher = EchoLauncher::new();
    let server = spawn_server(&launcher).await;
    server
        .manager
        .create_session("s1", as_consumer(&FakeConsumer::new("s1")), BTreeMap::new(), "nb.py")
        .await
        .unwrap();

    let resp = reqwest::get(format!("{}/health", server.base_url))
        .await
        .expect("HTTP GET /health");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 1);
    assert_eq!(body["active_connections"], 1);

    server.manager.shutdown().await;
    server.shutdown.cancel();
}

#[tokio::test]
async fn kernel_requests_need_a_known_session() {
    let launcher = EchoLauncher::new();
    let server = spawn_server(&launcher).await;
    let body = json!({ "cell_ids": ["cell-0"], "codes": ["x = 1"] });

    let missing = post(&server, "/api/kernel/run", None, body.clone()).await;
    assert_eq!(missing.status(), 400);
    let error: Value = missing.json().await.unwrap();
    assert!(error["error"].as_str().unwrap().contains(SESSION_ID_HEADER));

    let unknown = post(&server, "/api/kernel/run", Some("nobody"), body).await;
    assert_eq!(unknown.status(), 404);

    server.shutdown.cancel();
}

#[tokio::test]
async fn run_rejects_ragged_requests() {
    let launcher = EchoLauncher::new();
    let server = spawn_server(&launcher).await;
    server
        .manager
        .create_session("s1", as_consumer(&FakeConsumer::new("s1")), BTreeMap::new(), "nb.py")
        .await
        .unwrap();

    let resp = post(
        &server,
        "/api/kernel/run",
        Some("s1"),
        json!({ "cell_ids": ["cell-0", "cell-1"], "codes": ["x = 1"] }),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert!(!launcher.controls().contains(&"execute-multiple".to_owned()));

    server.manager.shutdown().await;
    server.shutdown.cancel();
}

#[tokio::test]
async fn run_reaches_the_kernel_and_other_consumers() {
    let launcher = EchoLauncher::new();
    let server = spawn_server(&launcher).await;
    let main = FakeConsumer::new("s1");
    let session = server
        .manager
        .create_session("s1", as_consumer(&main), BTreeMap::new(), "nb.py")
        .await
        .unwrap();
    let kiosk = FakeConsumer::new("k1");
    session
        .connect_consumer(as_consumer(&kiosk), ConsumerRole::Kiosk)
        .unwrap();

    let resp = post(
        &server,
        "/api/kernel/run",
        Some("s1"),
        json!({ "cell_ids": ["cell-0"], "codes": ["x = 2"] }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "success": true }));

    assert_eq!(kiosk.server_ops(), vec!["update-cell-codes", "focus-cell"]);
    assert!(main.server_ops().is_empty());
    wait_until("cell ran", || main.count("cell-op") == 3).await;
    assert_eq!(session.get_current_state().last_executed_code()["cell-0"], "x = 2");

    server.manager.shutdown().await;
    server.shutdown.cancel();
}

#[tokio::test]
async fn ui_values_and_interrupts_are_accepted() {
    let launcher = EchoLauncher::new();
    let server = spawn_server(&launcher).await;
    let session = server
        .manager
        .create_session("s1", as_consumer(&FakeConsumer::new("s1")), BTreeMap::new(), "nb.py")
        .await
        .unwrap();

    let resp = post(
        &server,
        "/api/kernel/set_ui_element_value",
        Some("s1"),
        json!({ "object_ids": ["slider"], "values": [3] }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(session.get_current_state().ui_values()["slider"], json!(3));

    let resp = post(&server, "/api/kernel/interrupt", Some("s1"), json!({})).await;
    assert_eq!(resp.status(), 200);

    server.manager.shutdown().await;
    server.shutdown.cancel();
}

#[tokio::test]
async fn shutdown_closes_sessions_and_stops_the_server() {
    let launcher = EchoLauncher::new();
    let server = spawn_server(&launcher).await;
    let session = server
        .manager
        .create_session("s1", as_consumer(&FakeConsumer::new("s1")), BTreeMap::new(), "nb.py")
        .await
        .unwrap();

    let resp = post(&server, "/api/kernel/shutdown", Some("s1"), json!({})).await;
    assert_eq!(resp.status(), 200);

    assert!(session.is_closed());
    assert_eq!(server.manager.session_count(), 0);
    assert!(server.shutdown.is_cancelled());
    wait_until("kernel stopped", || launcher.stop_count() == 1).await;
}

#[tokio::test]
async fn edit_mode_kernel_requests_need_the_access_token() {
    let launcher = EchoLauncher::new();
    let server = spawn_server(&launcher).await;
    server
        .manager
        .create_session("s1", as_consumer(&FakeConsumer::new("s1")), BTreeMap::new(), "nb.py")
        .await
        .unwrap();
    let body = json!({ "cell_ids": ["cell-0"], "codes": ["x = 3"] });

    let missing = post_with_token(&server, "/api/kernel/run", Some("s1"), None, body.clone()).await;
    assert_eq!(missing.status(), 401);
    let wrong =
        post_with_token(&server, "/api/kernel/run", Some("s1"), Some("guess"), body.clone()).await;
    assert_eq!(wrong.status(), 401);
    let shutdown =
        post_with_token(&server, "/api/kernel/shutdown", Some("s1"), None, json!({})).await;
    assert_eq!(shutdown.status(), 401);

    assert!(!launcher.controls().contains(&"execute-multiple".to_owned()));
    assert!(!server.shutdown.is_cancelled());
    assert_eq!(server.manager.session_count(), 1);

    let allowed = post(&server, "/api/kernel/run", Some("s1"), body).await;
    assert_eq!(allowed.status(), 200);

    server.manager.shutdown().await;
    server.shutdown.cancel();
}

#[tokio::test]
async fn kiosk_consumers_cannot_send_kernel_requests() {
    let launcher = EchoLauncher::new();
    let server = spawn_server(&launcher).await;
    let session = server
        .manager
        .create_session("s1", as_consumer(&FakeConsumer::new("s1")), BTreeMap::new(), "nb.py")
        .await
        .unwrap();
    session
        .connect_consumer(as_consumer(&FakeConsumer::new("k1")), ConsumerRole::Kiosk)
        .unwrap();

    let run = post(
        &server,
        "/api/kernel/run",
        Some("k1"),
        json!({ "cell_ids": ["cell-0"], "codes": ["x = 4"] }),
    )
    .await;
    assert_eq!(run.status(), 404);
    let shutdown = post(&server, "/api/kernel/shutdown", Some("k1"), json!({})).await;
    assert_eq!(shutdown.status(), 404);

    assert!(!launcher.controls().contains(&"execute-multiple".to_owned()));
    assert!(!server.shutdown.is_cancelled());
    assert!(!session.is_closed());

    server.manager.shutdown().await;
    server.shutdown.cancel();
}

#[tokio::test]
async fn kiosk_reusing_the_session_id_is_rejected() {
    let launcher = EchoLauncher::new();
    let server = spawn_server(&launcher).await;
    let main = FakeConsumer::new("s1");
    let session = server
        .manager
        .create_session("s1", as_consumer(&main), BTreeMap::new(), "nb.py")
        .await
        .unwrap();
    main.set_state(ConnectionState::Closed);
    assert!(session.maybe_disconnect_consumer());
    session
        .connect_consumer(as_consumer(&FakeConsumer::new("s1")), ConsumerRole::Kiosk)
        .unwrap();

    let resp = post(&server, "/api/kernel/interrupt", Some("s1"), json!({})).await;
    assert_eq!(resp.status(), 401);

    server.manager.shutdown().await;
    server.shutdown.cancel();
}
