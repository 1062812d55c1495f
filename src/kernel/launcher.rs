//! Launch contract between the supervisor and a kernel.
//!
//! Process kernels receive [`KernelInit`] as the first line on their socket.
//! Thread kernels are started through a registered [`KernelLauncher`] that
//! receives the same payload plus in-memory queue endpoints.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::queues::KernelQueues;
use crate::models::requests::{AppMetadata, CellConfig};
use crate::models::CellId;

/// Environment variable carrying the local socket name to a process kernel.
pub const KERNEL_SOCKET_ENV: &str = "NOTEBOOK_KERNEL_SOCKET";

/// Everything a kernel needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelInit {
    /// True in edit mode.
    pub is_edit_mode: bool,
    /// Configuration of every cell, by id.
    pub cell_configs: BTreeMap<CellId, CellConfig>,
    /// Application metadata.
    pub app_metadata: AppMetadata,
    /// Effective user configuration.
    pub user_config: Value,
    /// Whether the server can serve virtual files produced by cells.
    pub virtual_files_supported: bool,
    /// Forward stdout/stderr to consumers.
    pub redirect_console_to_browser: bool,
    /// Whether interrupts arrive on the interrupt queue instead of `SIGINT`.
    pub interrupt_queue: bool,
    /// Where to write a profile on shutdown.
    pub profile_path: Option<PathBuf>,
    /// Numeric log level (10 debug, 20 info, 30 warning, 40 error).
    pub log_level: u8,
}

/// Arguments for a thread kernel.
#[derive(Debug)]
pub struct KernelArgs {
    /// Launch payload.
    pub init: KernelInit,
    /// Kernel-side queue endpoints. `queues.stream` is always set.
    pub queues: KernelQueues,
}

/// Entry point for kernels that run on a server thread.
///
/// `launch` runs on a dedicated OS thread and should return once it has
/// received `ControlRequest::Stop` or its control queue is closed. It must
/// not block forever on anything else; the supervisor never joins the
/// thread.
pub trait KernelLauncher: Send + Sync + 'static {
    /// Run the kernel until stopped.
    fn launch(&self, args: KernelArgs);
}

/// Map a textual log level to the numeric form kernels expect.
#[must_use]
pub fn log_level_number(level: &str) -> u8 {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" => 10,
        "warn" | "warning" => 30,
        "error" => 40,
        "critical" => 50,
        _ => 20,
    }
}
