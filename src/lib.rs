//! Atelier: session orchestration for command-line AI agents
//!
//! Many tools, one easel. Each external agent CLI is wrapped by an adapter,
//! every invocation runs under a supervised child process, and every tool's
//! output is normalized into the same event stream.

pub mod adapter;
pub mod cli;
pub mod config;
pub mod process;
pub mod session;
pub mod stream;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtelierError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session busy: {0} already has a message in flight")]
    SessionBusy(String),

    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("Process timed out after {}ms", .0.as_millis())]
    ProcessTimeout(Duration),

    #[error("Process exited with {code:?}: {stderr}")]
    ProcessExit { code: Option<i32>, stderr: String },

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Session capacity exceeded ({0} sessions)")]
    CapacityExceeded(usize),

    #[error("Adapter error: {0}")]
    Adapter(String),

    /// A terminal error event surfaced from an agent's event stream
    #[error("{kind}: {message}")]
    Reported { kind: ErrorKind, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable machine-readable classification of an [`AtelierError`].
///
/// Transport layers map these to protocol-level signals without matching on
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SessionNotFound,
    SessionBusy,
    AdapterNotFound,
    AdapterUnavailable,
    ProcessSpawnError,
    ProcessTimeout,
    ProcessExitError,
    MalformedOutput,
    CapacityExceeded,
    AdapterError,
    ConfigError,
    IoError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::SessionBusy => "session_busy",
            ErrorKind::AdapterNotFound => "adapter_not_found",
            ErrorKind::AdapterUnavailable => "adapter_unavailable",
            ErrorKind::ProcessSpawnError => "process_spawn_error",
            ErrorKind::ProcessTimeout => "process_timeout",
            ErrorKind::ProcessExitError => "process_exit_error",
            ErrorKind::MalformedOutput => "malformed_output",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::AdapterError => "adapter_error",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::IoError => "io_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl AtelierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AtelierError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            AtelierError::SessionBusy(_) => ErrorKind::SessionBusy,
            AtelierError::AdapterNotFound(_) => ErrorKind::AdapterNotFound,
            AtelierError::AdapterUnavailable(_) => ErrorKind::AdapterUnavailable,
            AtelierError::ProcessSpawn(_) => ErrorKind::ProcessSpawnError,
            AtelierError::ProcessTimeout(_) => ErrorKind::ProcessTimeout,
            AtelierError::ProcessExit { .. } => ErrorKind::ProcessExitError,
            AtelierError::MalformedOutput(_) => ErrorKind::MalformedOutput,
            AtelierError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            AtelierError::Adapter(_) => ErrorKind::AdapterError,
            AtelierError::Reported { kind, .. } => *kind,
            AtelierError::Config(_) => ErrorKind::ConfigError,
            AtelierError::Io(_) | AtelierError::Json(_) => ErrorKind::IoError,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::ProcessTimeout
    }
}

pub type Result<T> = std::result::Result<T, AtelierError>;
