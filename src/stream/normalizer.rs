//! Raw process output → normalized events
//!
//! A `Normalizer` is fed stdout chunks as they arrive and the exit report
//! once the process is gone. Chunk boundaries are arbitrary: a JSON line or a
//! UTF-8 sequence split across two reads is reassembled before it is used.

use super::json::{self, Interpreted};
use super::{AgentEvent, FinalResult, Usage};
use crate::process::{ProcessExit, Termination};
use crate::{AtelierError, ErrorKind};
use serde::{Deserialize, Serialize};

/// Longest escape sequence held back waiting for its terminator
const MAX_ESCAPE_CARRY: usize = 256;

/// Raw output format an adapter's tool speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    /// One JSON record per line
    JsonLines,
    /// Free-form text; the whole output is the answer
    PlainText,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::JsonLines => write!(f, "json-lines"),
            Dialect::PlainText => write!(f, "plain-text"),
        }
    }
}

#[derive(Debug, Default)]
struct PendingResult {
    content: Option<String>,
    is_error: bool,
}

/// Stateful converter for one invocation's output
#[derive(Debug)]
pub struct Normalizer {
    dialect: Dialect,
    /// Bytes of an incomplete line (JSON) or UTF-8 sequence (plain text)
    pending: Vec<u8>,
    /// Leading bytes of `pending` already known to hold no newline
    scanned: usize,
    /// Unterminated ANSI escape at the end of the last plain-text chunk
    escape_carry: String,
    /// Assistant text (JSON) or the full output (plain text)
    text: String,
    /// Unparseable lines, the fallback answer when nothing else was said
    raw: String,
    result: Option<PendingResult>,
    failure: Option<String>,
    usage: Usage,
    resume_token: Option<String>,
    saw_output: bool,
}

impl Normalizer {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            pending: Vec::new(),
            scanned: 0,
            escape_carry: String::new(),
            text: String::new(),
            raw: String::new(),
            result: None,
            failure: None,
            usage: Usage::default(),
            resume_token: None,
            saw_output: false,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Latest resumption token seen so far
    pub fn resume_token(&self) -> Option<&str> {
        self.resume_token.as_deref()
    }

    /// Feed one stdout chunk, returning the progress events it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        match self.dialect {
            Dialect::JsonLines => {
                let mut buf = std::mem::take(&mut self.pending);
                buf.extend_from_slice(chunk);
                let mut events = Vec::new();
                let mut start = 0;
                let mut search = self.scanned;
                while let Some(offset) = buf[search..].iter().position(|b| *b == b'\n') {
                    let end = search + offset;
                    self.handle_line(&buf[start..end], &mut events);
                    start = end + 1;
                    search = start;
                }
                buf.drain(..start);
                self.scanned = buf.len();
                self.pending = buf;
                events
            }
            Dialect::PlainText => {
                let text = take_utf8(&mut self.pending, chunk);
                self.plain_progress(&text)
            }
        }
    }

    /// Close the stream given how the process ended.
    ///
    /// Returns the remaining events, ending with exactly one terminal event.
    pub fn finish(&mut self, exit: &ProcessExit) -> Vec<AgentEvent> {
        let mut events = Vec::new();

        match self.dialect {
            Dialect::JsonLines => {
                self.scanned = 0;
                if !self.pending.is_empty() {
                    let tail = std::mem::take(&mut self.pending);
                    let line = String::from_utf8_lossy(&tail);
                    // Best effort only: an incomplete record is dropped quietly
                    match serde_json::from_str::<serde_json::Value>(line.trim()) {
                        Ok(value) => self.apply(json::interpret(&value), &mut events),
                        Err(_) => {
                            tracing::debug!(bytes = tail.len(), "discarding trailing partial line");
                        }
                    }
                }
            }
            Dialect::PlainText => {
                if !self.pending.is_empty() {
                    let tail = std::mem::take(&mut self.pending);
                    let text = String::from_utf8_lossy(&tail).into_owned();
                    events.extend(self.plain_progress(&text));
                }
                let carry = std::mem::take(&mut self.escape_carry);
                events.extend(self.emit_plain(&carry));
            }
        }

        events.push(self.terminal_event(exit));
        events
    }

    fn terminal_event(&mut self, exit: &ProcessExit) -> AgentEvent {
        let code = match &exit.termination {
            Termination::Exited { code } => *code,
            Termination::TimedOut { .. } => {
                return AgentEvent::from_error(&AtelierError::ProcessTimeout(exit.timeout));
            }
            Termination::Terminated { .. } => {
                return AgentEvent::error(ErrorKind::ProcessExitError, "process terminated before completing");
            }
            Termination::Killed => {
                return AgentEvent::error(ErrorKind::ProcessExitError, "process killed during cleanup");
            }
            Termination::Errored { message } => {
                return AgentEvent::error(
                    ErrorKind::ProcessExitError,
                    format!("lost track of process: {}", message),
                );
            }
        };

        if let Some(message) = self.failure.take() {
            return AgentEvent::error(ErrorKind::AdapterError, message);
        }

        let result = self.result.take().unwrap_or_default();
        if result.is_error {
            let message = result
                .content
                .unwrap_or_else(|| "agent reported an error result".to_string());
            return AgentEvent::error(ErrorKind::AdapterError, message);
        }

        let content = result
            .content
            .unwrap_or_else(|| {
                if self.text.trim().is_empty() {
                    self.raw.clone()
                } else {
                    self.text.clone()
                }
            })
            .trim()
            .to_string();

        let has_output = match self.dialect {
            Dialect::JsonLines => self.saw_output,
            Dialect::PlainText => !content.is_empty(),
        };

        if code != Some(0) {
            if !has_output {
                return AgentEvent::from_error(&AtelierError::ProcessExit {
                    code,
                    stderr: exit.stderr.trim().to_string(),
                });
            }
            // Several tools exit non-zero after printing a usable answer
            tracing::warn!(?code, "non-zero exit with output, keeping the output");
        }

        if exit.truncated {
            tracing::warn!(stdout_bytes = exit.stdout_bytes, "final result built from truncated output");
        }

        AgentEvent::Final(FinalResult {
            content,
            usage: std::mem::take(&mut self.usage),
            resume_token: self.resume_token.clone(),
            truncated: exit.truncated,
            exit_code: code,
        })
    }

    fn handle_line(&mut self, bytes: &[u8], events: &mut Vec<AgentEvent>) {
        let line = String::from_utf8_lossy(bytes);
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => self.apply(json::interpret(&value), events),
            Err(e) => {
                // Banners and stray prints are common; degrade, don't abort
                tracing::debug!("{}", AtelierError::MalformedOutput(e.to_string()));
                self.apply(vec![Interpreted::Raw(line.to_string())], events);
            }
        }
    }

    fn apply(&mut self, items: Vec<Interpreted>, events: &mut Vec<AgentEvent>) {
        for item in items {
            match item {
                Interpreted::Text { content, delta } => {
                    self.saw_output = true;
                    if !delta && !self.text.is_empty() && !self.text.ends_with('\n') {
                        self.text.push('\n');
                    }
                    self.text.push_str(&content);
                    events.push(AgentEvent::Text { content });
                }
                Interpreted::ToolCall { name, input } => {
                    self.saw_output = true;
                    events.push(AgentEvent::ToolCall { name, input });
                }
                Interpreted::ToolResult { content } => {
                    self.saw_output = true;
                    events.push(AgentEvent::ToolResult { content });
                }
                Interpreted::ResumeToken(token) => {
                    self.resume_token = Some(token);
                }
                Interpreted::Result {
                    content,
                    usage,
                    is_error,
                } => {
                    self.saw_output = true;
                    self.usage.merge(usage);
                    self.result = Some(PendingResult { content, is_error });
                }
                Interpreted::Usage(usage) => self.usage.merge(usage),
                Interpreted::Failure(message) => {
                    self.failure = Some(message);
                }
                Interpreted::Raw(line) => {
                    self.saw_output = true;
                    if !self.raw.is_empty() {
                        self.raw.push('\n');
                    }
                    self.raw.push_str(&line);
                    events.push(AgentEvent::Text { content: line });
                }
            }
        }
    }

    fn plain_progress(&mut self, text: &str) -> Vec<AgentEvent> {
        let mut text = std::mem::take(&mut self.escape_carry) + text;
        let cut = partial_escape_start(&text);
        if text.len() - cut <= MAX_ESCAPE_CARRY {
            self.escape_carry = text.split_off(cut);
        }
        self.emit_plain(&text)
    }

    fn emit_plain(&mut self, text: &str) -> Vec<AgentEvent> {
        let clean = strip_ansi_escapes::strip_str(text);
        if clean.is_empty() {
            return Vec::new();
        }
        self.saw_output = true;
        self.text.push_str(&clean);
        vec![AgentEvent::Text { content: clean }]
    }
}

/// Byte offset of an escape sequence still missing its terminator, or
/// `text.len()` if the text ends cleanly.
fn partial_escape_start(text: &str) -> usize {
    let bytes = text.as_bytes();
    let Some(esc) = bytes.iter().rposition(|b| *b == 0x1b) else {
        return text.len();
    };
    let rest = &bytes[esc + 1..];
    let complete = match rest.first() {
        None => false,
        // CSI ends with a byte in 0x40..=0x7e
        Some(b'[') => rest[1..].iter().any(|b| (0x40..=0x7e).contains(b)),
        // OSC ends with BEL
        Some(b']') => rest.contains(&0x07),
        // Character set designation takes one more byte
        Some(b'(' | b')' | b'*' | b'+' | b'#' | b'%') => rest.len() >= 2,
        Some(_) => true,
    };
    if complete { text.len() } else { esc }
}

/// Append `chunk` to `pending` and take the longest valid UTF-8 prefix.
///
/// An incomplete multi-byte sequence at the end stays in `pending` for the
/// next chunk; genuinely invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>, chunk: &[u8]) -> String {
    pending.extend_from_slice(chunk);
    let split = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let rest = pending.split_off(split);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}
