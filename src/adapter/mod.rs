//! Adapter capability contract
//!
//! Every external agent CLI is driven through the same [`Adapter`] trait; the
//! session registry never knows which tool is behind a session.

pub mod command;
mod registry;

pub use command::{CommandAdapter, CommandProfile, PromptPlacement};
pub use registry::AdapterRegistry;

use crate::session::SessionId;
use crate::stream::EventStream;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// When an adapter first talks to its tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMode {
    /// No external call until the first message
    Lazy,
    /// `spawn` runs the tool once to establish a resumable context
    Eager,
}

/// Options for starting a session
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Directory the tool runs in. The registry fills in its default.
    pub working_dir: Option<PathBuf>,
    pub model: Option<String>,
    /// Tool/permission restrictions passed through to the CLI
    pub allowed_tools: Vec<String>,
    /// Continue a conversation started elsewhere
    pub resume_token: Option<String>,
    /// Per-session default for sends that don't carry their own timeout
    pub timeout: Option<Duration>,
}

impl SpawnOptions {
    pub fn in_dir(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(working_dir.into()),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for one send
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the session and adapter defaults
    pub timeout: Option<Duration>,
    /// Overrides the session model for this message only
    pub model: Option<String>,
}

impl SendOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// Adapter-side view of a started session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterSession {
    pub session_id: SessionId,
    pub working_dir: PathBuf,
    pub model: Option<String>,
    pub resume_token: Option<String>,
}

/// Capability set every agent backend implements.
///
/// Adapters own their session state and their process table. At most one
/// process per session: `send` on a session with a process still running
/// fails with `SessionBusy`.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    fn init_mode(&self) -> InitMode {
        InitMode::Lazy
    }

    /// Timeout for sends that specify none, at either level
    fn default_timeout(&self) -> Duration;

    /// Whether the external tool is installed and usable
    async fn is_available(&self) -> bool;

    async fn spawn(&self, session_id: &str, options: &SpawnOptions) -> Result<AdapterSession>;

    /// Start one invocation. The stream ends with exactly one terminal event.
    async fn send(&self, session_id: &str, message: &str, options: &SendOptions) -> Result<EventStream>;

    /// Gracefully interrupt the running invocation, if any.
    ///
    /// `Ok(false)` means there was nothing to interrupt.
    async fn interrupt(&self, session_id: &str) -> Result<bool>;

    /// Drop adapter-side state and stop any running invocation.
    async fn terminate(&self, session_id: &str) -> Result<()>;

    /// True while a process is running for the session
    fn is_session_active(&self, session_id: &str) -> bool;

    fn active_sessions(&self) -> Vec<SessionId>;

    /// Kill every process this adapter started
    async fn kill_all_processes(&self);
}
