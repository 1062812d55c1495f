//! Session mode: whether the server edits or serves notebooks.
//!
//! `SessionMode` is used as the `--mode` CLI flag value and as the `mode`
//! key in `config.toml`. It decides kernel isolation (process vs thread)
//! and the session resumption policy.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Top-level operating mode for every session owned by a server.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Interactive editing. One process kernel per notebook, interruptible.
    #[default]
    Edit,
    /// Read-only serving. Many sessions, each backed by a kernel thread.
    Run,
}

impl SessionMode {
    /// Whether kernels for this mode run in their own OS process.
    #[must_use]
    pub fn uses_process_kernel(self) -> bool {
        matches!(self, Self::Edit)
    }
}
