//! Normalized agent events
//!
//! Whatever dialect an agent CLI speaks, its output becomes a sequence of
//! [`AgentEvent`]s: progress (text, tool calls, tool results) followed by
//! exactly one terminal event, either a final result or an error.

pub mod json;
pub mod normalizer;

pub use normalizer::{Dialect, Normalizer};

use crate::process::{ProcessOutput, RunningProcess};
use crate::{AtelierError, ErrorKind};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Usage statistics as reported by the tool.
///
/// Fields the tool does not report stay `None`; nothing is estimated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }

    /// Fill fields still missing here from `other`.
    pub fn merge(&mut self, other: Usage) {
        self.input_tokens = self.input_tokens.or(other.input_tokens);
        self.output_tokens = self.output_tokens.or(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.or(other.cache_read_tokens);
        self.cost_usd = self.cost_usd.or(other.cost_usd);
        self.duration_ms = self.duration_ms.or(other.duration_ms);
        self.num_turns = self.num_turns.or(other.num_turns);
    }
}

/// Payload of the terminal success event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub content: String,
    #[serde(default, skip_serializing_if = "Usage::is_empty")]
    pub usage: Usage,
    /// Token the tool hands out for resuming this conversation later
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Output exceeded the cap and was partially discarded
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// One normalized event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AgentEvent {
    #[serde(rename = "progress:text")]
    Text { content: String },

    #[serde(rename = "progress:tool-call")]
    ToolCall {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },

    #[serde(rename = "progress:tool-result")]
    ToolResult { content: String },

    #[serde(rename = "result")]
    Final(FinalResult),

    #[serde(rename = "error")]
    Error {
        error_kind: ErrorKind,
        message: String,
        is_timeout: bool,
    },
}

impl AgentEvent {
    pub fn text(content: impl Into<String>) -> Self {
        AgentEvent::Text {
            content: content.into(),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        AgentEvent::Error {
            error_kind: kind,
            message: message.into(),
            is_timeout: kind == ErrorKind::ProcessTimeout,
        }
    }

    pub fn from_error(err: &AtelierError) -> Self {
        AgentEvent::Error {
            error_kind: err.kind(),
            message: err.to_string(),
            is_timeout: err.is_timeout(),
        }
    }

    /// Final results and errors end a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Final(_) | AgentEvent::Error { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, AgentEvent::Error { .. })
    }

    /// The wire name of this event's kind
    pub fn kind_name(&self) -> &'static str {
        match self {
            AgentEvent::Text { .. } => "progress:text",
            AgentEvent::ToolCall { .. } => "progress:tool-call",
            AgentEvent::ToolResult { .. } => "progress:tool-result",
            AgentEvent::Final(_) => "result",
            AgentEvent::Error { .. } => "error",
        }
    }

    /// Convert an error event back into a rejection
    pub fn to_error(&self) -> Option<AtelierError> {
        match self {
            AgentEvent::Error {
                error_kind,
                message,
                ..
            } => Some(AtelierError::Reported {
                kind: *error_kind,
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

/// Sending half of an [`EventStream`]
pub type EventSender = mpsc::UnboundedSender<AgentEvent>;

/// Lazy, asynchronous sequence of events from one send.
///
/// Unbounded so a producer never waits on a slow or absent consumer; the
/// process output cap bounds how much can pile up.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<AgentEvent>,
}

impl EventStream {
    pub fn channel() -> (EventSender, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, EventStream { rx })
    }

    /// A stream that replays a fixed list of events
    pub fn from_events(events: impl IntoIterator<Item = AgentEvent>) -> Self {
        let (tx, stream) = Self::channel();
        for event in events {
            let _ = tx.send(event);
        }
        stream
    }

    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    /// Drain the stream to its end
    pub async fn collect_events(mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl futures::Stream for EventStream {
    type Item = AgentEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Connect a running process to a normalizer.
///
/// `inspect` sees every event before it is forwarded; adapters use it to pick
/// up resumption tokens. The returned stream ends after the terminal event.
pub fn normalize<F>(mut process: RunningProcess, mut normalizer: Normalizer, mut inspect: F) -> EventStream
where
    F: FnMut(&AgentEvent) + Send + 'static,
{
    let (tx, stream) = EventStream::channel();

    tokio::spawn(async move {
        let session_id = process.session_id.clone();
        let mut finished = false;

        while let Some(item) = process.recv().await {
            let events = match item {
                ProcessOutput::Stdout(chunk) => normalizer.push(&chunk),
                ProcessOutput::Exit(exit) => {
                    finished = true;
                    normalizer.finish(&exit)
                }
            };
            for event in events {
                inspect(&event);
                let _ = tx.send(event);
            }
            if finished {
                break;
            }
        }

        if !finished {
            tracing::error!(session_id = %session_id, "process supervisor ended without an exit report");
            let event = AgentEvent::error(
                ErrorKind::ProcessExitError,
                "process supervisor ended without an exit report",
            );
            inspect(&event);
            let _ = tx.send(event);
        }
    });

    stream
}
