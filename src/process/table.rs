//! Active-process table
//!
//! One table per adapter, mapping a session to the single process currently
//! running on its behalf. Entries are removed by a drop guard owned by the
//! supervising task, so the table never holds a handle for a process that has
//! exited, even when whoever asked for the process has gone away.

use super::kill::{send_signal, Signal};
use crate::session::SessionId;
use crate::{AtelierError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;

/// Requests delivered to a supervising task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    /// Two-phase kill: SIGTERM, then SIGKILL after the grace window
    Terminate,
    /// Immediate SIGKILL
    Kill,
}

struct ProcessHandle {
    pid: u32,
    started_at: DateTime<Utc>,
    timeout: Duration,
    control: watch::Sender<Control>,
    generation: u64,
}

/// Read-only view of a tracked process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub session_id: SessionId,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub timeout: Duration,
}

#[derive(Default)]
struct TableInner {
    processes: Mutex<HashMap<SessionId, ProcessHandle>>,
    next_generation: AtomicU64,
}

/// Map of session → running process, shared by an adapter and its tasks
#[derive(Clone, Default)]
pub struct ProcessTable {
    inner: Arc<TableInner>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<SessionId, ProcessHandle>> {
        self.inner
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a process for `session_id` and track it.
    ///
    /// The occupancy check and the spawn happen under one lock, so two racing
    /// sends can never both get a process: the loser sees `SessionBusy` and
    /// nothing is spawned for it.
    pub fn register(
        &self,
        session_id: &str,
        timeout: Duration,
        spawn: impl FnOnce() -> Result<Child>,
    ) -> Result<(Child, Registration)> {
        let mut processes = self.processes();
        if processes.contains_key(session_id) {
            return Err(AtelierError::SessionBusy(session_id.to_string()));
        }

        let child = spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| AtelierError::ProcessSpawn("spawned process has no pid".to_string()))?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (control, control_rx) = watch::channel(Control::Run);
        processes.insert(
            session_id.to_string(),
            ProcessHandle {
                pid,
                started_at: Utc::now(),
                timeout,
                control,
                generation,
            },
        );
        tracing::debug!(session_id, pid, "registered process");

        Ok((
            child,
            Registration {
                table: self.clone(),
                session_id: session_id.to_string(),
                generation,
                control: control_rx,
            },
        ))
    }

    /// Send SIGINT to the session's process.
    ///
    /// `Ok(false)` when there is no tracked process or it has already exited.
    pub fn interrupt(&self, session_id: &str) -> Result<bool> {
        let Some(pid) = self.processes().get(session_id).map(|h| h.pid) else {
            return Ok(false);
        };
        Ok(send_signal(pid, Signal::Interrupt)?)
    }

    /// Ask the supervising task to run the two-phase kill.
    pub fn terminate(&self, session_id: &str) -> bool {
        match self.processes().get(session_id) {
            Some(handle) => {
                let _ = handle.control.send(Control::Terminate);
                true
            }
            None => false,
        }
    }

    /// SIGKILL every tracked process right now.
    ///
    /// The signal is delivered synchronously so nothing outlives the caller
    /// even if the runtime is shutting down; the supervising tasks are told
    /// as well so they deregister promptly.
    pub fn kill_all(&self) -> usize {
        let processes = self.processes();
        for (session_id, handle) in processes.iter() {
            if let Err(e) = send_signal(handle.pid, Signal::Kill) {
                tracing::warn!(session_id = %session_id, pid = handle.pid, "SIGKILL failed: {}", e);
            }
            let _ = handle.control.send(Control::Kill);
        }
        processes.len()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.processes().contains_key(session_id)
    }

    pub fn info(&self, session_id: &str) -> Option<ProcessInfo> {
        self.processes().get(session_id).map(|h| ProcessInfo {
            session_id: session_id.to_string(),
            pid: h.pid,
            started_at: h.started_at,
            timeout: h.timeout,
        })
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.processes().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.processes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes().is_empty()
    }

    fn deregister(&self, session_id: &str, generation: u64) {
        let mut processes = self.processes();
        if processes
            .get(session_id)
            .is_some_and(|h| h.generation == generation)
        {
            processes.remove(session_id);
            tracing::debug!(session_id, "deregistered process");
        }
    }
}

/// Ownership of a table slot. Dropping it frees the slot.
pub struct Registration {
    table: ProcessTable,
    session_id: SessionId,
    generation: u64,
    control: watch::Receiver<Control>,
}

impl Registration {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn control(&mut self) -> &mut watch::Receiver<Control> {
        &mut self.control
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.deregister(&self.session_id, self.generation);
    }
}
