//! Orchestrator configuration.

use crate::{AtelierError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default ceiling on concurrently registered sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Default per-invocation output cap (10 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Runtime config for the session registry and process runners.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Sessions beyond this count evict the least-recently-active one.
    pub max_sessions: usize,
    /// Idle duration after which the sweep evicts a session.
    pub session_timeout: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
    /// Output buffered per invocation before truncation kicks in.
    pub max_output_bytes: usize,
    /// Window between the graceful and the forceful kill signal.
    pub kill_grace: Duration,
    /// Capacity of the registry's broadcast channel.
    pub event_capacity: usize,
    pub default_working_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            kill_grace: Duration::from_secs(2),
            event_capacity: 256,
            default_working_dir: None,
        }
    }
}

impl AppConfig {
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_default_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_working_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(AtelierError::Config(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(AtelierError::Config(
                "max_output_bytes must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(AtelierError::Config(
                "sweep_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Working directory for sessions created without an explicit one.
    ///
    /// Falls back to the current directory, then the home directory.
    pub fn resolve_working_dir(&self) -> PathBuf {
        if let Some(dir) = &self.default_working_dir {
            return dir.clone();
        }
        std::env::current_dir()
            .ok()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
