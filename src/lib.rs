#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod kernel;
pub mod mode;
pub mod models;
pub mod notebook;
pub mod server;
pub mod session;
pub mod tokens;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
