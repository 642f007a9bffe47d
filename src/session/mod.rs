//! Session registry - logical conversations over adapter processes
//!
//! A session outlives any single process: it is created once, sent to any
//! number of times (one message in flight at a time), and destroyed by an
//! explicit terminate, the idle sweep, or capacity eviction.

mod events;
mod registry;
mod sweeper;

pub use events::{EventBus, RegistryEvent};
pub use registry::{SessionRegistry, WeakSessionRegistry};
pub use sweeper::SweeperHandle;

use crate::stream::{AgentEvent, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Unique session identifier
pub type SessionId = String;

/// Generate a unique session ID
pub fn generate_session_id() -> SessionId {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::random();
    format!("ses-{:x}-{:08x}", millis, suffix)
}

/// Registry-level status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Idle and ready for a message
    Stable,
    /// A message is in flight
    Running,
    /// The last message failed; the session is still usable
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Stable => write!(f, "stable"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// Bookkeeping the registry keeps for each session
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub adapter: String,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    /// Sends attempted, successful or not
    pub message_count: u64,
    pub(crate) in_flight: bool,
}

impl Session {
    pub(crate) fn new(id: SessionId, adapter: String, working_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            adapter,
            working_dir,
            created_at: now,
            last_activity: now,
            status: SessionStatus::Stable,
            message_count: 0,
            in_flight: false,
        }
    }

    /// Time since the last activity, zero if the clock went backwards
    pub fn idle(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

/// Returned by `create_session`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedSession {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub working_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

/// One entry of `list_sessions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub adapter: String,
    pub working_dir: PathBuf,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub has_active_process: bool,
}

/// Returned by `get_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub has_active_process: bool,
    pub idle_ms: u64,
}

/// Why an interrupt did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    SessionNotFound,
    NoActiveProcess,
}

/// Result of `interrupt`; a report, never an error for missing targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterruptOutcome {
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<InterruptReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<SessionStatus>,
}

impl InterruptOutcome {
    pub(crate) fn skipped(reason: InterruptReason, previous_status: Option<SessionStatus>) -> Self {
        Self {
            interrupted: false,
            reason: Some(reason),
            previous_status,
        }
    }
}

/// Collected outcome of a blocking `send`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendResponse {
    pub session_id: SessionId,
    pub content: String,
    #[serde(skip_serializing_if = "Usage::is_empty")]
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    pub truncated: bool,
    /// Every event of the send, terminal result included
    pub events: Vec<AgentEvent>,
}

/// Why a session was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Explicit,
    IdleTimeout,
    Capacity,
    Shutdown,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Explicit => write!(f, "explicit"),
            TerminationReason::IdleTimeout => write!(f, "idle_timeout"),
            TerminationReason::Capacity => write!(f, "capacity"),
            TerminationReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Returned by `shutdown`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub terminated: usize,
    /// Adapter cleanup failures, `"<session>: <error>"`
    pub errors: Vec<String>,
}
