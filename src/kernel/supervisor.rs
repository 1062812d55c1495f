//! Kernel supervisor.
//!
//! Starts exactly one kernel per session and owns it until close:
//!
//! - **Process kernels** (edit mode) are spawned from `kernel.command` with
//!   `kill_on_drop(true)`. The child connects back over a local socket named
//!   in [`KERNEL_SOCKET_ENV`]; if it does not connect within
//!   `kernel.startup_timeout_seconds` it is killed. The read half of the
//!   connection becomes the session's message stream and a pump task copies
//!   the queue set into the write half.
//! - **Thread kernels** (run mode, or edit mode with `kernel.threaded`) run
//!   a registered [`KernelLauncher`] on a named OS thread. They cannot be
//!   interrupted or killed; close sends `Stop` and lets the thread wind down
//!   on its own.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::SinkExt;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::kernel::codec::KernelCodec;
use crate::kernel::launcher::{
    log_level_number, KernelArgs, KernelInit, KernelLauncher, KERNEL_SOCKET_ENV,
};
use crate::kernel::protocol::KernelInbound;
use crate::kernel::queues::{KernelQueues, QueueManager};
use crate::mode::SessionMode;
use crate::models::ops::KernelMessage;
use crate::models::requests::{AppMetadata, CellConfig, ControlRequest};
use crate::models::CellId;
use crate::{AppError, Result};

/// Poll period while waiting for a kernel profile to appear.
const PROFILE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time allowed for the pump to flush `Stop` before a process is killed.
const STOP_FLUSH_GRACE: Duration = Duration::from_millis(500);

/// Where a session reads kernel messages from.
pub enum KernelStream {
    /// Read half of a process kernel's socket.
    Connection(Box<dyn AsyncRead + Send + Unpin>),
    /// Stream queue fed by a thread kernel.
    Queue(UnboundedReceiver<KernelMessage>),
}

impl fmt::Debug for KernelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(_) => f.write_str("KernelStream::Connection"),
            Self::Queue(_) => f.write_str("KernelStream::Queue"),
        }
    }
}

/// Inputs for a [`KernelManager`].
#[derive(Clone)]
pub struct KernelManagerOptions {
    /// Session mode, forwarded to the kernel.
    pub mode: SessionMode,
    /// Server configuration.
    pub config: Arc<GlobalConfig>,
    /// Metadata forwarded to the kernel.
    pub app_metadata: AppMetadata,
    /// Per-cell configuration.
    pub cell_configs: BTreeMap<CellId, CellConfig>,
    /// Effective user configuration.
    pub user_config: Value,
    /// Whether virtual files are served.
    pub virtual_files_supported: bool,
    /// Thread kernel entry point; required in run mode.
    pub launcher: Option<Arc<dyn KernelLauncher>>,
}

impl fmt::Debug for KernelManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelManagerOptions")
            .field("mode", &self.mode)
            .field("filename", &self.app_metadata.filename)
            .field("has_launcher", &self.launcher.is_some())
            .finish_non_exhaustive()
    }
}

struct ProcessKernel {
    child: Child,
    pump: JoinHandle<()>,
}

struct ThreadKernel {
    handle: std::thread::JoinHandle<()>,
}

enum KernelTask {
    Process(ProcessKernel),
    Thread(ThreadKernel),
}

/// Owns one kernel and its queue set.
pub struct KernelManager {
    options: KernelManagerOptions,
    queues: Arc<QueueManager>,
    profile_path: Option<PathBuf>,
    task: Mutex<Option<KernelTask>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for KernelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelManager")
            .field("options", &self.options)
            .field("profile_path", &self.profile_path)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl KernelManager {
    /// Build a supervisor; nothing is launched until [`KernelManager::start_kernel`].
    #[must_use]
    pub fn new(options: KernelManagerOptions, queues: Arc<QueueManager>) -> Self {
        let profile_path = if options.config.uses_process_kernel() {
            options
                .config
                .kernel
                .profile_dir
                .as_deref()
                .map(|dir| profile_path_for(dir, options.app_metadata.filename.as_deref()))
        } else {
            None
        };

        Self {
            options,
            queues,
            profile_path,
            task: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Profile output path, when profiling is configured.
    #[must_use]
    pub fn profile_path(&self) -> Option<&Path> {
        self.profile_path.as_deref()
    }

    /// Queue set shared with the session.
    #[must_use]
    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    /// Launch payload derived from the options.
    #[must_use]
    pub fn kernel_init(&self) -> KernelInit {
        let config = &self.options.config;
        KernelInit {
            is_edit_mode: self.options.mode == SessionMode::Edit,
            cell_configs: self.options.cell_configs.clone(),
            app_metadata: self.options.app_metadata.clone(),
            user_config: self.options.user_config.clone(),
            virtual_files_supported: self.options.virtual_files_supported,
            redirect_console_to_browser: config.redirect_console_to_browser,
            interrupt_queue: self.queues.has_interrupt_queue(),
            profile_path: self.profile_path.clone(),
            log_level: log_level_number(&config.log_level),
        }
    }

    /// Launch the kernel and return the stream its messages arrive on.
    ///
    /// # Errors
    ///
    /// - `AppError::Kernel` if the kernel was already started, the process
    ///   cannot be spawned, it does not connect back in time, or no
    ///   thread launcher is registered in run mode.
    /// - `AppError::Ipc` if the local socket cannot be created or written.
    pub async fn start_kernel(&self) -> Result<KernelStream> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::Kernel("kernel already started".into()));
        }

        let init = self.kernel_init();
        let queues = self.queues.take_kernel_queues()?;

        let (task, stream) = if self.options.config.uses_process_kernel() {
            self.start_process(init, queues).await?
        } else {
            self.start_thread(init, queues)?
        };

        self.task
            .lock()
            .map_err(|_| AppError::Kernel("kernel task lock poisoned".into()))?
            .replace(task);
        Ok(stream)
    }

    async fn start_process(
        &self,
        init: KernelInit,
        queues: KernelQueues,
    ) -> Result<(KernelTask, KernelStream)> {
        let config = &self.options.config;
        let socket_name = format!("notebook-kernel-{}.sock", Uuid::new_v4().simple());

        let listener_name = socket_name
            .clone()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Ipc(format!("invalid kernel socket name: {err}")))?;
        let listener = ListenerOptions::new()
            .name(listener_name)
            .create_tokio()
            .map_err(|err| AppError::Ipc(format!("failed to create kernel listener: {err}")))?;

        let mut cmd = Command::new(&config.kernel.command);
        cmd.args(&config.kernel.args)
            .env(KERNEL_SOCKET_ENV, &socket_name)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Kernel(format!("failed to spawn kernel: {err}")))?;

        let startup_timeout = config.kernel_startup_timeout();
        let stream = match tokio::time::timeout(startup_timeout, listener.accept()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                child.kill().await.ok();
                return Err(AppError::Ipc(format!("kernel connection failed: {err}")));
            }
            Err(_elapsed) => {
                child.kill().await.ok();
                return Err(AppError::Kernel(format!(
                    "startup timeout: kernel did not connect within {startup_timeout:?}"
                )));
            }
        };
        drop(listener);

        let (reader, writer) = stream.split();
        let mut writer = FramedWrite::new(writer, KernelCodec::new());
        writer
            .send(KernelInbound::Launch(Box::new(init)).to_line()?)
            .await?;

        info!(
            pid = child.id(),
            filename = ?self.options.app_metadata.filename,
            "kernel process connected"
        );

        let span = info_span!("kernel_pump", pid = child.id());
        let pump = tokio::spawn(pump_queues(queues, writer).instrument(span));

        Ok((
            KernelTask::Process(ProcessKernel { child, pump }),
            KernelStream::Connection(Box::new(reader)),
        ))
    }

    fn start_thread(
        &self,
        init: KernelInit,
        queues: KernelQueues,
    ) -> Result<(KernelTask, KernelStream)> {
        let launcher = self
            .options
            .launcher
            .clone()
            .ok_or_else(|| AppError::Kernel("no thread kernel launcher registered".into()))?;
        let stream = self.queues.take_stream()?;

        let name = format!(
            "notebook-kernel-{}",
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || launcher.launch(KernelArgs { init, queues }))
            .map_err(|err| AppError::Kernel(format!("failed to spawn kernel thread: {err}")))?;

        info!(thread = %name, "kernel thread started");

        Ok((
            KernelTask::Thread(ThreadKernel { handle }),
            KernelStream::Queue(stream),
        ))
    }

    /// Whether the kernel is running. `false` before start and after close.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        let Ok(mut guard) = self.task.lock() else {
            return false;
        };
        match guard.as_mut() {
            Some(KernelTask::Process(process)) => matches!(process.child.try_wait(), Ok(None)),
            Some(KernelTask::Thread(thread)) => !thread.handle.is_finished(),
            None => false,
        }
    }

    /// Ask the kernel to abandon the current run. Fire-and-forget.
    pub fn interrupt_kernel(&self) {
        let Ok(guard) = self.task.lock() else {
            return;
        };
        match guard.as_ref() {
            Some(KernelTask::Process(process)) => {
                if self.queues.put_interrupt() {
                    debug!("interrupt queued");
                    return;
                }
                match process.child.id() {
                    Some(pid) => send_sigint(pid),
                    None => debug!("interrupt skipped: kernel process already exited"),
                }
            }
            Some(KernelTask::Thread(_)) => debug!("thread kernels cannot be interrupted"),
            None => debug!("interrupt skipped: kernel not running"),
        }
    }

    /// Shut the kernel down. Idempotent; only the first call does anything.
    ///
    /// Sends `Stop`, waits (bounded) for a profile if one was requested,
    /// closes the queues without waiting for the kernel to drain them, and
    /// kills a process that is still running.
    pub async fn close_kernel(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let task = self.task.lock().ok().and_then(|mut guard| guard.take());

        match task {
            Some(KernelTask::Process(mut process)) => {
                if matches!(process.child.try_wait(), Ok(None)) {
                    if let Err(err) = self.queues.put_control(ControlRequest::Stop) {
                        debug!(%err, "stop not delivered");
                    }
                    if let Some(path) = &self.profile_path {
                        wait_for_profile(path, self.options.config.profile_flush_timeout()).await;
                    }
                }
                self.queues.close_queues();

                if tokio::time::timeout(STOP_FLUSH_GRACE, &mut process.pump)
                    .await
                    .is_err()
                {
                    process.pump.abort();
                }

                if matches!(process.child.try_wait(), Ok(None)) {
                    if let Err(err) = process.child.kill().await {
                        warn!(%err, "failed to kill kernel process");
                    }
                }
                info!(filename = ?self.options.app_metadata.filename, "kernel process closed");
            }
            Some(KernelTask::Thread(thread)) => {
                if !thread.handle.is_finished() {
                    if let Err(err) = self.queues.put_control(ControlRequest::Stop) {
                        debug!(%err, "stop not delivered");
                    }
                }
                self.queues.close_queues();
                info!(filename = ?self.options.app_metadata.filename, "kernel thread stopped");
            }
            None => self.queues.close_queues(),
        }
    }
}

/// Copy queue items to the kernel socket until every queue is closed.
async fn pump_queues<W: AsyncWrite + Unpin>(
    mut queues: KernelQueues,
    mut writer: FramedWrite<W, KernelCodec>,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            Some(request) = queues.control.recv() => KernelInbound::Control(request),
            Some(()) = recv_interrupt(&mut queues.interrupt) => KernelInbound::Interrupt,
            Some(request) = queues.set_ui_element.recv() => KernelInbound::SetUiElement(request),
            Some(request) = queues.completion.recv() => KernelInbound::Completion(request),
            Some(text) = queues.input.recv() => KernelInbound::Input(text),
            else => break,
        };

        let line = match envelope.to_line() {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "dropping unencodable queue item");
                continue;
            }
        };

        if let Err(err) = writer.send(line).await {
            warn!(%err, "kernel socket write failed");
            break;
        }
        if envelope.is_stop() {
            debug!("stop forwarded to kernel");
        }
    }
}

async fn recv_interrupt(rx: &mut Option<UnboundedReceiver<()>>) -> Option<()> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

/// `<profile_dir>/<file name><uuid>`.
fn profile_path_for(dir: &Path, filename: Option<&str>) -> PathBuf {
    let base = filename
        .and_then(|name| Path::new(name).file_name())
        .map_or_else(|| "notebook".to_owned(), |name| name.to_string_lossy().into_owned());
    dir.join(format!("{base}{}", Uuid::new_v4()))
}

async fn wait_for_profile(path: &Path, limit: Duration) {
    let poll = async {
        while !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::time::sleep(PROFILE_POLL_INTERVAL).await;
        }
    };
    match tokio::time::timeout(limit, poll).await {
        Ok(()) => info!(path = %path.display(), "kernel profile written"),
        Err(_elapsed) => warn!(
            path = %path.display(),
            ?limit,
            "kernel profile not written before timeout"
        ),
    }
}

#[cfg(unix)]
fn send_sigint(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "kernel pid out of range");
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGINT) {
        warn!(pid, %err, "failed to interrupt kernel");
    }
}

#[cfg(not(unix))]
fn send_sigint(pid: u32) {
    warn!(pid, "no interrupt mechanism for this kernel");
}
