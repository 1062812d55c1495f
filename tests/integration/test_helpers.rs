//! Shared test helpers for session-level integration tests.
//!
//! Provides a thread kernel that echoes cell transitions, a recording
//! consumer, and ready-made configurations and managers so individual test
//! modules can focus on behaviour rather than boilerplate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notebook_sessions::config::GlobalConfig;
use notebook_sessions::kernel::{KernelArgs, KernelLauncher};
use notebook_sessions::models::ops::{CellOp, KernelMessage, MessageOperation, RuntimeState};
use notebook_sessions::models::requests::{AppMetadata, ControlRequest};
use notebook_sessions::notebook::{CellScriptFileManager, LocalFileRouter};
use notebook_sessions::session::{
    ConnectionState, ConsumerCallback, Session, SessionConsumer, SessionManager,
    SessionManagerOptions, SessionOptions,
};
use notebook_sessions::tokens::{AuthToken, SkewProtectionToken};

/// Code that makes [`EchoLauncher`] kernels exit as if they crashed.
pub const CRASH: &str = "exit()";

/// Two-cell notebook used by most tests.
pub const NOTEBOOK: &str = "# %% first\nx = 1\n\n# %% second\ny = x + 1\n";

// ── Kernel ───────────────────────────────────────────────────────────────────

/// Thread kernel that answers every run with queued → running → idle
/// transitions for each cell.
#[derive(Clone, Default)]
pub struct EchoLauncher {
    stops: Arc<AtomicUsize>,
    controls: Arc<Mutex<Vec<String>>>,
}

impl EchoLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many `Stop` requests kernels of this launcher received.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Kinds of every control request received, oldest first.
    pub fn controls(&self) -> Vec<String> {
        self.controls.lock().unwrap().clone()
    }
}

impl KernelLauncher for EchoLauncher {
    fn launch(&self, args: KernelArgs) {
        let KernelArgs { mut queues, .. } = args;
        let Some(stream) = queues.stream.clone() else {
            return;
        };

        while let Some(request) = queues.control.blocking_recv() {
            self.controls.lock().unwrap().push(request.kind().to_owned());
            match request {
                ControlRequest::Stop => {
                    self.stops.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                ControlRequest::ExecuteMultiple(execute) => {
                    if execute.codes.iter().any(|code| code == CRASH) {
                        break;
                    }
                    for cell_id in execute.cell_ids {
                        for status in [RuntimeState::Queued, RuntimeState::Running, RuntimeState::Idle] {
                            let mut op = CellOp::new(cell_id.clone());
                            op.status = Some(status);
                            let _ = stream.send(KernelMessage::from(MessageOperation::CellOp(op)));
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

// ── Consumer ─────────────────────────────────────────────────────────────────

/// Consumer that records every message it is handed, through either path.
pub struct FakeConsumer {
    id: String,
    received: Arc<Mutex<Vec<KernelMessage>>>,
    state: Mutex<ConnectionState>,
    stops: AtomicUsize,
}

impl FakeConsumer {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            received: Arc::new(Mutex::new(Vec::new())),
            state: Mutex::new(ConnectionState::Open),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn messages(&self) -> Vec<KernelMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<String> {
        self.messages().into_iter().map(|message| message.op).collect()
    }

    /// Received operations other than kernel cell transitions.
    pub fn server_ops(&self) -> Vec<String> {
        self.ops().into_iter().filter(|op| op != "cell-op").collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.ops().iter().filter(|seen| *seen == op).count()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl SessionConsumer for FakeConsumer {
    fn consumer_id(&self) -> String {
        self.id.clone()
    }

    fn on_start(&self) -> ConsumerCallback {
        let received = Arc::clone(&self.received);
        Arc::new(move |message: &KernelMessage| received.lock().unwrap().push(message.clone()))
    }

    fn on_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
    }

    fn write_operation(&self, message: &KernelMessage) {
        self.received.lock().unwrap().push(message.clone());
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }
}

pub fn as_consumer(consumer: &Arc<FakeConsumer>) -> Arc<dyn SessionConsumer> {
    Arc::clone(consumer) as Arc<dyn SessionConsumer>
}

// ── Configuration and construction ───────────────────────────────────────────

/// Edit-mode configuration with thread kernels and no session cache.
pub fn edit_config() -> GlobalConfig {
    GlobalConfig::from_toml_str(
        r#"
mode = "edit"
ttl_seconds = 60

[kernel]
threaded = true

[session_cache]
enabled = false
"#,
    )
    .expect("valid test config")
}

/// Run-mode configuration.
pub fn run_config() -> GlobalConfig {
    GlobalConfig::from_toml_str("mode = \"run\"\nttl_seconds = 60\n").expect("valid test config")
}

pub fn write_notebook(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, source).unwrap();
    path
}

/// Manager serving notebooks from `root` with [`EchoLauncher`] kernels.
pub fn test_manager(config: GlobalConfig, root: &Path, launcher: &EchoLauncher) -> Arc<SessionManager> {
    let mode = config.mode;
    Arc::new(SessionManager::new(SessionManagerOptions {
        config: Arc::new(config),
        file_router: Arc::new(LocalFileRouter::directory(root)),
        launcher: Some(Arc::new(launcher.clone())),
        cli_args: BTreeMap::new(),
        argv: Vec::new(),
        auth_token: AuthToken::new("secret"),
        skew_protection_token: SkewProtectionToken::for_mode(mode, None),
    }))
}

/// Start a session on `notebook` directly, bypassing the manager.
pub async fn start_session(
    config: GlobalConfig,
    notebook: &Path,
    launcher: &EchoLauncher,
    consumer: &Arc<FakeConsumer>,
) -> Arc<Session> {
    Session::create(SessionOptions {
        initialization_id: "nb.py".into(),
        config: Arc::new(config),
        app_file_manager: Arc::new(CellScriptFileManager::open(notebook).unwrap()),
        app_metadata: AppMetadata::default(),
        virtual_files_supported: true,
        launcher: Some(Arc::new(launcher.clone())),
        consumer: as_consumer(consumer),
    })
    .await
    .expect("session should start")
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
