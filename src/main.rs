#![forbid(unsafe_code)]

//! `notebook-server`: serves reactive notebooks over HTTP and WebSocket.
//!
//! Loads configuration, builds the session manager and runs the axum
//! server until ctrl-c, SIGTERM or a shutdown request.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use notebook_sessions::config::GlobalConfig;
use notebook_sessions::mode::SessionMode;
use notebook_sessions::notebook::{FileRouter, LocalFileRouter};
use notebook_sessions::server::{self, AppState};
use notebook_sessions::session::{SessionManager, SessionManagerOptions};
use notebook_sessions::tokens::{AuthToken, SkewProtectionToken};
use notebook_sessions::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "notebook-server", about = "Reactive notebook server", version, long_about = None)]
struct Cli {
    /// Notebook to serve; serves the working directory when omitted.
    file: Option<PathBuf>,

    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured mode.
    #[arg(long, value_enum)]
    mode: Option<SessionMode>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,

    /// Watch notebook files for external edits.
    #[arg(long)]
    watch: bool,

    /// Access token; random when omitted.
    #[arg(long)]
    token: Option<String>,

    /// Arguments forwarded to notebooks, after `--`.
    #[arg(last = true)]
    notebook_args: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("notebook-server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.watch |= args.watch;
    config.validate()?;
    let config = Arc::new(config);
    info!(mode = ?config.mode, watch = config.watch, "configuration loaded");

    if config.mode == SessionMode::Run {
        warn!("run mode needs an embedded kernel launcher; sessions will fail to start without one");
    }

    // ── Build session manager ───────────────────────────
    let file_router: Arc<dyn FileRouter> = match &args.file {
        Some(file) => Arc::new(LocalFileRouter::single_file(file)),
        None => Arc::new(LocalFileRouter::directory(
            std::env::current_dir()
                .map_err(|err| AppError::Config(format!("no working directory: {err}")))?,
        )),
    };
    let source = args
        .file
        .as_ref()
        .and_then(|file| std::fs::read_to_string(file).ok());
    let auth_token = args.token.map_or_else(AuthToken::random, AuthToken::new);

    let manager = Arc::new(SessionManager::new(SessionManagerOptions {
        config: Arc::clone(&config),
        file_router,
        launcher: None,
        cli_args: parse_notebook_args(&args.notebook_args),
        argv: args.notebook_args,
        auth_token,
        skew_protection_token: SkewProtectionToken::for_mode(config.mode, source.as_deref()),
    }));
    if config.mode == SessionMode::Edit && !config.quiet {
        info!(
            url = %format!("http://{}:{}/?access_token={}", config.host, config.port, manager.auth_token().as_str()),
            "open the editor"
        );
    }

    // ── Serve until shutdown ────────────────────────────
    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    let result = server::serve(AppState::new(Arc::clone(&manager), ct)).await;
    manager.shutdown().await;
    info!("notebook-server shut down");
    result
}

/// Turn `--key value` and `--flag` pairs into a JSON map.
fn parse_notebook_args(args: &[String]) -> BTreeMap<String, Value> {
    let mut parsed = BTreeMap::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        let Some(key) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
            continue;
        };
        if let Some((key, value)) = key.split_once('=') {
            parsed.insert(key.to_owned(), Value::String(value.to_owned()));
            continue;
        }
        let value = match iter.peek() {
            Some(next) if !next.starts_with('-') => iter.next().map_or(Value::Bool(true), |v| Value::String(v.clone())),
            _ => Value::Bool(true),
        };
        parsed.insert(key.to_owned(), value);
    }
    parsed
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
