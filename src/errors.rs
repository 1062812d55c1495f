//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Kernel launch, supervision, or shutdown failure.
    Kernel(String),
    /// Local socket communication failure with a process kernel.
    Ipc(String),
    /// Session bookkeeping invariant was violated.
    ///
    /// Indicates a bug in session tracking and is never silently corrected.
    InvalidSession(String),
    /// Consumer registration was rejected by a room.
    Consumer(String),
    /// Session cache read, write, or (de)serialization failure.
    Cache(String),
    /// Notebook file could not be read, saved, renamed, or reloaded.
    FileManager(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Malformed or unacceptable client request.
    BadRequest(String),
    /// Caller presented a missing or wrong access token.
    Unauthorized(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// HTTP-like status code used when surfacing this error to a client.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::FileManager(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::NotFound(_) => 404,
            Self::Consumer(_) => 409,
            Self::Config(_)
            | Self::Kernel(_)
            | Self::Ipc(_)
            | Self::InvalidSession(_)
            | Self::Cache(_)
            | Self::Io(_) => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Kernel(msg) => write!(f, "kernel: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::InvalidSession(msg) => write!(f, "invalid session: {msg}"),
            Self::Consumer(msg) => write!(f, "consumer: {msg}"),
            Self::Cache(msg) => write!(f, "cache: {msg}"),
            Self::FileManager(msg) => write!(f, "file manager: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Cache(format!("json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
