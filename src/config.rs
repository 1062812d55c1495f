//! Global configuration parsing and validation.
//!
//! The configuration is built once at startup and handed to every component
//! as an `Arc<GlobalConfig>`; nothing reads process-wide settings.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mode::SessionMode;
use crate::{AppError, Result};

/// How the file watcher reacts to a notebook saved outside the editor.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WatcherOnSave {
    /// Mark every cell's code as stale without running anything.
    #[default]
    Lazy,
    /// Re-execute exactly the cells whose code changed.
    Autorun,
}

/// Kernel launch settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct KernelConfig {
    /// Program started for process kernels (edit mode).
    #[serde(default = "default_kernel_command")]
    pub command: String,
    /// Arguments passed to the kernel program.
    #[serde(default = "default_kernel_args")]
    pub args: Vec<String>,
    /// Maximum time to wait for a process kernel to connect back.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
    /// Directory receiving per-kernel profiling artifacts, if profiling is on.
    #[serde(default)]
    pub profile_dir: Option<PathBuf>,
    /// Upper bound on waiting for a kernel to flush its profile on close.
    #[serde(default = "default_profile_flush_timeout")]
    pub profile_flush_timeout_seconds: u64,
    /// Run edit-mode kernels on server threads through the registered
    /// launcher instead of as child processes.
    #[serde(default)]
    pub threaded: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            command: default_kernel_command(),
            args: default_kernel_args(),
            startup_timeout_seconds: default_startup_timeout(),
            profile_dir: None,
            profile_flush_timeout_seconds: default_profile_flush_timeout(),
            threaded: false,
        }
    }
}

/// Runtime behaviour toggles.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Reaction to external saves of a watched notebook.
    #[serde(default)]
    pub watcher_on_save: WatcherOnSave,
}

/// Session view cache settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionCacheConfig {
    /// Whether edit-mode sessions restore from and persist to the cache.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between cache flushes.
    #[serde(default = "default_cache_interval")]
    pub interval_seconds: u64,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_cache_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_kernel_command() -> String {
    "python".into()
}

fn default_kernel_args() -> Vec<String> {
    vec!["-m".into(), "notebook_kernel".into()]
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_profile_flush_timeout() -> u64 {
    30
}

fn default_cache_interval() -> u64 {
    2
}

fn default_ttl_seconds() -> u64 {
    120
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    2718
}

fn default_log_level() -> String {
    "info".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Edit or run mode for every session.
    #[serde(default)]
    pub mode: SessionMode,
    /// Interface the HTTP server binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP port; `0` picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Development mode enables verbose diagnostics.
    #[serde(default)]
    pub development_mode: bool,
    /// Suppress non-essential console output.
    #[serde(default)]
    pub quiet: bool,
    /// Whether run-mode clients may receive cell source code.
    #[serde(default)]
    pub include_code: bool,
    /// Watch notebook files and react to external edits.
    #[serde(default)]
    pub watch: bool,
    /// Seconds an orphaned session keeps its kernel alive.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Forward kernel stdout/stderr to the browser console.
    #[serde(default)]
    pub redirect_console_to_browser: bool,
    /// Log level forwarded to kernels.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Kernel launch settings.
    #[serde(default)]
    pub kernel: KernelConfig,
    /// Runtime behaviour toggles.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Session view cache settings.
    #[serde(default)]
    pub session_cache: SessionCacheConfig,
    /// Free-form user configuration forwarded to kernels.
    #[serde(default)]
    pub user: toml::Table,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::default(),
            host: default_host(),
            port: default_port(),
            development_mode: false,
            quiet: false,
            include_code: false,
            watch: false,
            ttl_seconds: default_ttl_seconds(),
            redirect_console_to_browser: false,
            log_level: default_log_level(),
            kernel: KernelConfig::default(),
            runtime: RuntimeConfig::default(),
            session_cache: SessionCacheConfig::default(),
            user: toml::Table::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Time an orphaned session is kept before it is closed.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Interval between session cache flushes.
    #[must_use]
    pub fn cache_interval(&self) -> Duration {
        Duration::from_secs(self.session_cache.interval_seconds)
    }

    /// Maximum wait for a process kernel to connect back.
    #[must_use]
    pub fn kernel_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.kernel.startup_timeout_seconds)
    }

    /// Maximum wait for a kernel profile to appear on close.
    #[must_use]
    pub fn profile_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.kernel.profile_flush_timeout_seconds)
    }

    /// Whether kernels run as child processes.
    #[must_use]
    pub fn uses_process_kernel(&self) -> bool {
        self.mode.uses_process_kernel() && !self.kernel.threaded
    }

    /// The `[user]` table as JSON, the form kernels receive.
    #[must_use]
    pub fn user_config_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.user).unwrap_or(serde_json::Value::Null)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.uses_process_kernel() && self.kernel.command.trim().is_empty() {
            return Err(AppError::Config(
                "kernel.command must not be empty for process kernels".into(),
            ));
        }

        if self.kernel.startup_timeout_seconds == 0 {
            return Err(AppError::Config(
                "kernel.startup_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.session_cache.interval_seconds == 0 {
            return Err(AppError::Config(
                "session_cache.interval_seconds must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
