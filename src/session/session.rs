//! One notebook session: a kernel, its consumers and their shared view.
//!
//! A session is created with its main consumer attached. Kernel output
//! reaches consumers through the [`MessageDistributor`]; server-originated
//! operations go through [`Session::write_operation`]. Both paths update the
//! [`SessionView`] so a consumer that attaches later can be brought up to
//! date.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::kernel::{KernelLauncher, KernelManager, KernelManagerOptions, QueueManager};
use crate::mode::SessionMode;
use crate::models::ops::{KernelMessage, KernelReady, MessageOperation};
use crate::models::requests::{
    AppMetadata, CodeCompletionRequest, ControlRequest, CreationRequest, ExecutionRequest,
    HttpRequest, InstantiateRequest, SetUiElementValueRequest,
};
use crate::models::{ConsumerId, SessionId};
use crate::notebook::{merge_config, AppFileManager};
use crate::session::consumer::{ConnectionState, ConsumerRole, SessionConsumer};
use crate::session::distributor::{source_for, Disposable, MessageDistributor};
use crate::session::room::Room;
use crate::session::serialize::{SessionCacheKey, SessionCacheManager};
use crate::session::view::SessionView;
use crate::Result;

/// How often the kernel is checked for liveness.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Everything needed to start a session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Id the main consumer connected with.
    pub initialization_id: SessionId,
    /// Server configuration.
    pub config: Arc<GlobalConfig>,
    /// Notebook backing the session.
    pub app_file_manager: Arc<dyn AppFileManager>,
    /// Metadata forwarded to the kernel.
    pub app_metadata: AppMetadata,
    /// Whether virtual files are served.
    pub virtual_files_supported: bool,
    /// Thread kernel entry point; required in run mode.
    pub launcher: Option<Arc<dyn KernelLauncher>>,
    /// First, main, consumer.
    pub consumer: Arc<dyn SessionConsumer>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("initialization_id", &self.initialization_id)
            .field("mode", &self.config.mode)
            .field("path", &self.app_file_manager.path())
            .finish_non_exhaustive()
    }
}

/// A running notebook session.
pub struct Session {
    initialization_id: SessionId,
    mode: SessionMode,
    config: Arc<GlobalConfig>,
    app_file_manager: Arc<dyn AppFileManager>,
    kernel: KernelManager,
    distributor: MessageDistributor,
    room: Room,
    view: Arc<Mutex<SessionView>>,
    view_subscription: Mutex<Option<Disposable>>,
    sequence: Mutex<()>,
    cache: Mutex<Option<SessionCacheManager>>,
    file_watch: Mutex<Option<(PathBuf, u64)>>,
    heartbeat_cancel: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    closed_signal: CancellationToken,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("initialization_id", &self.initialization_id)
            .field("mode", &self.mode)
            .field("room", &self.room)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Session {
    /// Start a kernel and attach the main consumer.
    ///
    /// The view subscribes to the distributor before any consumer, so it
    /// never misses a message a consumer has seen.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` or `AppError::Ipc` if the kernel cannot be
    /// started, and `AppError::Consumer` if the consumer cannot be attached.
    /// A kernel that did start is closed again before returning an error.
    pub async fn create(options: SessionOptions) -> Result<Arc<Self>> {
        let SessionOptions {
            initialization_id,
            config,
            app_file_manager,
            app_metadata,
            virtual_files_supported,
            launcher,
            consumer,
        } = options;
        let mode = config.mode;
        let span = info_span!("session_create", session_id = %initialization_id, ?mode);

        async move {
            let cells = app_file_manager.cell_data();
            let queues = Arc::new(QueueManager::new(config.uses_process_kernel()));
            let kernel = KernelManager::new(
                KernelManagerOptions {
                    mode,
                    config: Arc::clone(&config),
                    app_metadata,
                    cell_configs: cells
                        .iter()
                        .map(|cell| (cell.cell_id.clone(), cell.config.clone()))
                        .collect(),
                    user_config: merge_config(
                        config.user_config_json(),
                        app_file_manager.script_config(),
                    ),
                    virtual_files_supported,
                    launcher,
                },
                queues,
            );

            let stream = match kernel.start_kernel().await {
                Ok(stream) => stream,
                Err(err) => {
                    kernel.close_kernel().await;
                    return Err(err);
                }
            };

            let mut view = SessionView::new();
            view.set_cell_ids(cells.iter().map(|cell| cell.cell_id.clone()).collect());
            let view = Arc::new(Mutex::new(view));

            let distributor = MessageDistributor::new(source_for(stream));
            let view_sink = Arc::clone(&view);
            let view_subscription = distributor.add_consumer(Arc::new(move |message| {
                lock(&view_sink).add_raw_operation(message);
            }));

            let session = Arc::new(Self {
                initialization_id,
                mode,
                config,
                app_file_manager,
                kernel,
                distributor,
                room: Room::new(),
                view,
                view_subscription: Mutex::new(Some(view_subscription)),
                sequence: Mutex::new(()),
                cache: Mutex::new(None),
                file_watch: Mutex::new(None),
                heartbeat_cancel: CancellationToken::new(),
                heartbeat: Mutex::new(None),
                closed: AtomicBool::new(false),
                closed_signal: CancellationToken::new(),
            });

            let started = session
                .connect_consumer(consumer, ConsumerRole::Main)
                .and_then(|()| session.distributor.start());
            if let Err(err) = started {
                session.close().await;
                return Err(err);
            }

            let heartbeat = spawn_heartbeat(Arc::downgrade(&session), session.heartbeat_cancel.clone());
            *lock(&session.heartbeat) = Some(heartbeat);

            info!("session started");
            Ok(session)
        }
        .instrument(span)
        .await
    }

    // ── Kernel requests ───────────────────────────────────────────────────

    /// Send a control request to the kernel.
    ///
    /// Set-UI-element requests are mirrored to their own queue. A run
    /// request tells other consumers about the new code, and focuses the
    /// cell when exactly one cell runs. `from` is excluded from those
    /// broadcasts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the queues are closed.
    pub fn put_control_request(&self, request: ControlRequest, from: Option<&str>) -> Result<()> {
        let _sequence = lock(&self.sequence);
        debug!(kind = request.kind(), session_id = %self.initialization_id, "control request");

        self.kernel.queues().put_control(request.clone())?;
        if let ControlRequest::SetUiElementValue(set) = &request {
            self.kernel.queues().put_set_ui_element(set.clone())?;
        }

        if let ControlRequest::ExecuteMultiple(execute) = &request {
            let codes = MessageOperation::UpdateCellCodes {
                cell_ids: execute.cell_ids.clone(),
                codes: execute.codes.clone(),
                code_is_stale: false,
            };
            self.room.broadcast(&KernelMessage::from(&codes), from);
            if let [cell_id] = execute.cell_ids.as_slice() {
                let focus = MessageOperation::FocusCell {
                    cell_id: cell_id.clone(),
                };
                self.room.broadcast(&KernelMessage::from(&focus), from);
            }
        }

        lock(&self.view).add_control_request(&request);
        Ok(())
    }

    /// Send a completion request to the kernel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the queues are closed.
    pub fn put_completion_request(&self, request: CodeCompletionRequest) -> Result<()> {
        self.kernel.queues().put_completion(request)
    }

    /// Answer a stdin prompt and record the answer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the queues are closed.
    pub async fn put_input(&self, text: String) -> Result<()> {
        lock(&self.view).add_stdin(text.clone());
        self.kernel.queues().put_input(text).await
    }

    /// Interrupt the running cell, if any. Fire-and-forget.
    pub fn try_interrupt(&self) {
        info!(session_id = %self.initialization_id, "interrupting kernel");
        self.kernel.interrupt_kernel();
    }

    /// Run the whole notebook with initial UI element values.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the queues are closed.
    pub fn instantiate(
        &self,
        request: &InstantiateRequest,
        http_request: Option<HttpRequest>,
    ) -> Result<()> {
        let execution_requests = self
            .app_file_manager
            .cell_data()
            .into_iter()
            .map(|cell| ExecutionRequest {
                cell_id: cell.cell_id,
                code: cell.code,
                request: http_request.clone(),
            })
            .collect();
        let creation = CreationRequest {
            execution_requests,
            set_ui_element_value_request: SetUiElementValueRequest {
                object_ids: request.object_ids.clone(),
                values: request.values.clone(),
                token: Uuid::new_v4().to_string(),
                request: http_request.clone(),
            },
            auto_run: request.auto_run,
            request: http_request,
        };
        self.put_control_request(ControlRequest::Instantiate(creation), None)
    }

    // ── Consumers ─────────────────────────────────────────────────────────

    /// Record `operation` in the view and send it to every open consumer
    /// except `from`.
    pub fn write_operation(&self, operation: &MessageOperation, from: Option<&str>) {
        let _sequence = lock(&self.sequence);
        lock(&self.view).add_operation(operation);
        let delivered = self.room.broadcast(&KernelMessage::from(operation), from);
        debug!(op = operation.name(), delivered, "operation written");
    }

    /// Attach a consumer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Consumer` if the room rejects it; the consumer is
    /// stopped again and its subscription released.
    pub fn connect_consumer(
        &self,
        consumer: Arc<dyn SessionConsumer>,
        role: ConsumerRole,
    ) -> Result<()> {
        self.attach(consumer, role, || ())
    }

    /// Attach a consumer to a running session and return the operations
    /// that bring it up to date.
    ///
    /// The replay is captured while no message is in flight: the consumer
    /// sees every later message and none of the replayed ones twice.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Consumer` if the room rejects the consumer.
    pub fn resume_consumer(
        &self,
        consumer: Arc<dyn SessionConsumer>,
        role: ConsumerRole,
    ) -> Result<Vec<MessageOperation>> {
        let view = Arc::clone(&self.view);
        self.attach(consumer, role, move || lock(&view).operations())
    }

    fn attach<T>(
        &self,
        consumer: Arc<dyn SessionConsumer>,
        role: ConsumerRole,
        snapshot: impl FnOnce() -> T,
    ) -> Result<T> {
        let _sequence = lock(&self.sequence);
        let consumer_id = consumer.consumer_id();
        let callback = consumer.on_start();
        let (disposable, value) = self.distributor.add_consumer_with(callback, snapshot);

        if let Err(err) = self
            .room
            .add_consumer(Arc::clone(&consumer), disposable, consumer_id.clone(), role)
        {
            consumer.on_stop();
            warn!(consumer_id = %consumer_id, %err, "consumer rejected");
            return Err(err);
        }
        info!(consumer_id = %consumer_id, ?role, session_id = %self.initialization_id, "consumer attached");
        Ok(value)
    }

    /// Detach a consumer. Returns `false` if it was not attached.
    pub fn disconnect_consumer(&self, consumer_id: &str) -> bool {
        let removed = self.room.remove_consumer(consumer_id);
        if removed {
            info!(consumer_id, session_id = %self.initialization_id, "consumer detached");
        }
        removed
    }

    /// Detach the main consumer if it is no longer open.
    ///
    /// Returns whether a consumer was detached; the session is then ORPHANED.
    pub fn maybe_disconnect_consumer(&self) -> bool {
        let Some(main) = self.room.main_consumer() else {
            return false;
        };
        if main.connection_state() == ConnectionState::Open {
            return false;
        }
        self.disconnect_consumer(&main.consumer_id())
    }

    /// Snapshot of the notebook for a consumer that just attached.
    #[must_use]
    pub fn kernel_ready(&self, resumed: bool, kiosk: bool, include_code: bool) -> MessageOperation {
        let cells = self.app_file_manager.cell_data();
        let (ui_values, last_executed_code) = if resumed {
            let view = lock(&self.view);
            (
                Some(view.ui_values().clone()),
                Some(view.last_executed_code().clone()),
            )
        } else {
            (None, None)
        };

        MessageOperation::KernelReady(KernelReady {
            cell_ids: cells.iter().map(|cell| cell.cell_id.clone()).collect(),
            codes: if include_code {
                cells.iter().map(|cell| cell.code.clone()).collect()
            } else {
                Vec::new()
            },
            names: cells.iter().map(|cell| cell.name.clone()).collect(),
            configs: cells.iter().map(|cell| cell.config.clone()).collect(),
            layout: None,
            resumed,
            ui_values,
            last_executed_code,
            app_config: self.app_file_manager.app_config(),
            kiosk,
        })
    }

    // ── State ─────────────────────────────────────────────────────────────

    /// Connection state as seen by the session manager.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        if self.is_closed() {
            return ConnectionState::Closed;
        }
        self.room
            .main_consumer()
            .map_or(ConnectionState::Orphaned, |main| main.connection_state())
    }

    /// Copy of the current view.
    #[must_use]
    pub fn get_current_state(&self) -> SessionView {
        lock(&self.view).clone()
    }

    /// Restore the view from the session cache and keep it written back.
    ///
    /// Returns whether the cache was a hit. Unnamed notebooks have no cache.
    pub fn sync_session_view_from_cache(&self, version: &str) -> bool {
        let path = self.app_file_manager.path();
        let mut manager = SessionCacheManager::new(
            Arc::clone(&self.view),
            path,
            self.config.cache_interval(),
        );
        let key = SessionCacheKey {
            codes: self
                .app_file_manager
                .cell_data()
                .into_iter()
                .map(|cell| Some(cell.code))
                .collect(),
            version: version.to_owned(),
        };
        let hit = manager.read_session_view(&key);
        manager.start();

        let mut cache = lock(&self.cache);
        if let Some(mut previous) = cache.replace(manager) {
            previous.stop();
        }
        hit
    }

    /// Point the session cache at a renamed notebook.
    pub fn rename_cache_path(&self, new_path: PathBuf) {
        if let Some(manager) = lock(&self.cache).as_mut() {
            manager.rename_path(new_path);
        }
    }

    /// Whether the session cache writer is running.
    #[must_use]
    pub fn cache_is_running(&self) -> bool {
        lock(&self.cache)
            .as_ref()
            .is_some_and(SessionCacheManager::is_running)
    }

    pub(crate) fn set_file_watch(&self, path: PathBuf, id: u64) -> Option<(PathBuf, u64)> {
        lock(&self.file_watch).replace((path, id))
    }

    pub(crate) fn take_file_watch(&self) -> Option<(PathBuf, u64)> {
        lock(&self.file_watch).take()
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    /// Id the session was created with.
    #[must_use]
    pub fn initialization_id(&self) -> &str {
        &self.initialization_id
    }

    /// Session mode.
    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Notebook backing the session.
    #[must_use]
    pub fn app_file_manager(&self) -> &Arc<dyn AppFileManager> {
        &self.app_file_manager
    }

    /// Notebook path, if named.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.app_file_manager.path()
    }

    /// Whether the session's notebook is `path`.
    #[must_use]
    pub fn is_for_path(&self, path: &Path) -> bool {
        self.path().is_some_and(|own| own == path)
    }

    /// How long the session may stay orphaned.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.config.ttl()
    }

    /// Consumers attached to the session.
    #[must_use]
    pub fn room(&self) -> &Room {
        &self.room
    }

    /// Ids of every attached consumer.
    #[must_use]
    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.room.consumer_ids()
    }

    /// Whether the kernel is running.
    #[must_use]
    pub fn kernel_is_alive(&self) -> bool {
        self.kernel.is_alive()
    }

    /// Whether [`Session::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cancelled once the session has closed or been dropped.
    pub(crate) fn closed_signal(&self) -> CancellationToken {
        self.closed_signal.clone()
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    /// Shut the session down. Idempotent.
    ///
    /// Consumers are detached, then the distributor, heartbeat and cache
    /// writer stop, then the kernel is closed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let span = info_span!("session_close", session_id = %self.initialization_id);
        async {
            self.room.close();
            if let Some(subscription) = lock(&self.view_subscription).take() {
                subscription.dispose();
            }
            self.distributor.stop();

            self.heartbeat_cancel.cancel();
            drop(lock(&self.heartbeat).take());

            if let Some(mut cache) = lock(&self.cache).take() {
                cache.stop();
            }

            self.kernel.close_kernel().await;
            self.closed_signal.cancel();
            info!("session closed");
        }
        .instrument(span)
        .await;
    }
}

/// Close the session when its kernel dies. No restart is attempted.
#[must_use]
fn spawn_heartbeat(session: Weak<Session>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(session) = session.upgrade() else {
                break;
            };
            if session.is_closed() {
                break;
            }
            if session.kernel_is_alive() {
                continue;
            }

            let file = session
                .path()
                .map_or_else(|| "<unnamed>".to_owned(), |path| path.display().to_string());
            error!(session_id = %session.initialization_id, file = %file, "kernel for file {file} died unexpectedly");
            session.write_operation(
                &MessageOperation::Banner {
                    title: "Kernel died".into(),
                    description: format!("The kernel for {file} stopped unexpectedly."),
                    variant: Some("danger".into()),
                    action: Some("restart".into()),
                },
                None,
            );
            session.close().await;
            break;
        }
    })
}

impl Drop for Session {
    fn drop(&mut self) {
        self.heartbeat_cancel.cancel();
        self.closed_signal.cancel();
    }
}
