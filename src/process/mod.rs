//! Process Runner - one supervised child process per invocation
//!
//! A runner spawns the agent CLI with stdin closed and stdout/stderr piped,
//! arms a timeout, and hands back a [`RunningProcess`] whose channel yields
//! stdout chunks followed by exactly one [`ProcessExit`].
//!
//! # Supervision
//!
//! ```text
//!  ProcessRunner::spawn ──► ProcessTable slot (SessionBusy if taken)
//!           │
//!           ▼
//!   supervising task ── stdout chunks ──► RunningProcess
//!     │  timeout ──► KillEscalation (SIGTERM … grace … SIGKILL)
//!     │  Control::Terminate / Control::Kill from the table
//!     └─ exit ──► slot freed ──► ProcessExit
//! ```
//!
//! The slot is freed by the supervising task itself, never by the caller, so
//! an abandoned invocation still cleans up after itself.

pub mod buffer;
pub mod kill;
pub mod table;

pub use buffer::CappedBuffer;
pub use kill::{send_signal, Escalated, KillEscalation, Signal};
pub use table::{Control, ProcessInfo, ProcessTable, Registration};

use crate::config::AppConfig;
use crate::{AtelierError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 8 * 1024;

/// Upper bound on waiting for stderr after the process is gone.
///
/// A grandchild can inherit the pipe and keep it open indefinitely.
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// Upper bound on reading stdout left in the pipe once the process exited
const STDOUT_DRAIN: Duration = Duration::from_millis(250);

/// Everything needed to launch one invocation
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl RunSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// How a process came to an end
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Termination {
    /// Ran to completion. `code` is `None` when an outside signal ended it.
    Exited { code: Option<i32> },
    /// Deadline passed; `forced` if SIGKILL was needed
    TimedOut { forced: bool },
    /// Stopped on request via the process table
    Terminated { forced: bool },
    /// Bulk SIGKILL
    Killed,
    /// Waiting on the process failed
    Errored { message: String },
}

/// Final report of one invocation
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub termination: Termination,
    pub stderr: String,
    /// Total stdout bytes produced, including any discarded past the cap
    pub stdout_bytes: usize,
    /// True if output exceeded the cap and was partially discarded
    pub truncated: bool,
    pub duration: Duration,
    /// The deadline this invocation ran under
    pub timeout: Duration,
}

impl ProcessExit {
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited { code } => code,
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.termination, Termination::TimedOut { .. })
    }
}

/// Items yielded by a running process, in order
#[derive(Debug, Clone)]
pub enum ProcessOutput {
    Stdout(Vec<u8>),
    /// Always the last item
    Exit(ProcessExit),
}

/// Handle on a spawned invocation
#[derive(Debug)]
pub struct RunningProcess {
    pub session_id: String,
    pub pid: u32,
    pub timeout: Duration,
    output: mpsc::UnboundedReceiver<ProcessOutput>,
}

impl RunningProcess {
    /// Next stdout chunk or the final exit report.
    ///
    /// `None` only after the exit report has been delivered.
    pub async fn recv(&mut self) -> Option<ProcessOutput> {
        self.output.recv().await
    }
}

/// Spawns and supervises agent processes for one adapter
#[derive(Clone)]
pub struct ProcessRunner {
    table: ProcessTable,
    escalation: KillEscalation,
    max_output_bytes: usize,
}

impl ProcessRunner {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_limits(config.kill_grace, config.max_output_bytes)
    }

    pub fn with_limits(kill_grace: Duration, max_output_bytes: usize) -> Self {
        Self {
            table: ProcessTable::new(),
            escalation: KillEscalation::new(kill_grace),
            max_output_bytes,
        }
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Spawn `spec` on behalf of `session_id`.
    ///
    /// Fails with `SessionBusy` if the session already has a process, or
    /// `ProcessSpawn` if the OS refuses to start it.
    pub fn spawn(&self, session_id: &str, spec: &RunSpec) -> Result<RunningProcess> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            // Single-shot invocations: stdin is closed from the start
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let (mut child, registration) = self.table.register(session_id, spec.timeout, || {
            command.spawn().map_err(|e| {
                AtelierError::ProcessSpawn(format!(
                    "{} in {}: {}",
                    spec.program,
                    spec.working_dir.display(),
                    e
                ))
            })
        })?;

        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!(
            session_id,
            pid,
            program = %spec.program,
            timeout_ms = spec.timeout.as_millis() as u64,
            "spawned agent process"
        );

        tokio::spawn(supervise(Supervision {
            child,
            stdout,
            stderr,
            tx,
            registration,
            timeout: spec.timeout,
            escalation: self.escalation,
            max_output_bytes: self.max_output_bytes,
            started: Instant::now(),
        }));

        Ok(RunningProcess {
            session_id: session_id.to_string(),
            pid,
            timeout: spec.timeout,
            output: rx,
        })
    }
}

struct Supervision {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    tx: mpsc::UnboundedSender<ProcessOutput>,
    registration: Registration,
    timeout: Duration,
    escalation: KillEscalation,
    max_output_bytes: usize,
    started: Instant,
}

async fn supervise(sup: Supervision) {
    let Supervision {
        mut child,
        mut stdout,
        stderr,
        tx,
        mut registration,
        timeout,
        escalation,
        max_output_bytes,
        started,
    } = sup;

    let session_id = registration.session_id().to_string();
    let pid = child.id().unwrap_or_default();
    let mut stderr_task = tokio::spawn(read_capped(stderr, max_output_bytes));

    let mut budget = CappedBuffer::new(max_output_bytes);
    let mut buf = vec![0u8; READ_CHUNK];
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut control_open = true;

    let termination = loop {
        tokio::select! {
            // Control requests and the deadline win over pending output
            biased;

            changed = registration.control().changed(), if control_open => {
                if changed.is_err() {
                    control_open = false;
                    continue;
                }
                let request = *registration.control().borrow_and_update();
                match request {
                    Control::Run => continue,
                    Control::Terminate => {
                        tracing::info!(session_id = %session_id, pid, "terminating process");
                        break match escalation.run(&mut child).await {
                            Ok(outcome) => Termination::Terminated { forced: outcome.forced },
                            Err(e) => Termination::Errored { message: e.to_string() },
                        };
                    }
                    Control::Kill => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        break Termination::Killed;
                    }
                }
            }
            () = &mut deadline => {
                tracing::warn!(
                    session_id = %session_id,
                    pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "process timed out"
                );
                break match escalation.run(&mut child).await {
                    Ok(outcome) => Termination::TimedOut { forced: outcome.forced },
                    Err(e) => Termination::Errored { message: e.to_string() },
                };
            }
            read = read_some(&mut stdout, &mut buf), if stdout.is_some() => {
                match read {
                    Ok(0) => stdout = None,
                    Ok(n) => forward(&mut budget, &tx, &buf[..n], &session_id, pid),
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, pid, "stdout read failed: {}", e);
                        stdout = None;
                    }
                }
            }
            // Exit is observed even while a grandchild holds stdout open
            status = child.wait() => {
                break match status {
                    Ok(status) => Termination::Exited { code: status.code() },
                    Err(e) => Termination::Errored { message: e.to_string() },
                };
            }
        }
    };

    // The child is reaped on every path above. Free the slot now so no
    // signal can reach a recycled pid while the pipes drain.
    drop(registration);

    if matches!(termination, Termination::Exited { .. }) {
        let leftover = async {
            while let Some(pipe) = stdout.as_mut() {
                match pipe.read(&mut buf).await {
                    Ok(n) if n > 0 => forward(&mut budget, &tx, &buf[..n], &session_id, pid),
                    _ => break,
                }
            }
        };
        if tokio::time::timeout(STDOUT_DRAIN, leftover).await.is_err() {
            tracing::debug!(session_id = %session_id, pid, "stdout still open after exit, stopped reading");
        }
    }

    let stderr = match tokio::time::timeout(STDERR_DRAIN, &mut stderr_task).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            stderr_task.abort();
            String::new()
        }
    };

    let exit = ProcessExit {
        termination,
        stderr,
        stdout_bytes: budget.total_written(),
        truncated: budget.truncated(),
        duration: started.elapsed(),
        timeout,
    };

    tracing::info!(
        session_id = %session_id,
        pid,
        termination = ?exit.termination,
        duration_ms = exit.duration.as_millis() as u64,
        stdout_bytes = exit.stdout_bytes,
        "agent process finished"
    );

    let _ = tx.send(ProcessOutput::Exit(exit));
}

/// Pass a stdout chunk on, within the output budget
fn forward(
    budget: &mut CappedBuffer,
    tx: &mpsc::UnboundedSender<ProcessOutput>,
    chunk: &[u8],
    session_id: &str,
    pid: u32,
) {
    let was_truncated = budget.truncated();
    let kept = budget.admit(chunk.len());
    if kept > 0 {
        // Receiver gone just means nobody is listening any more
        let _ = tx.send(ProcessOutput::Stdout(chunk[..kept].to_vec()));
    }
    if budget.truncated() && !was_truncated {
        tracing::warn!(
            session_id,
            pid,
            limit = budget.capacity(),
            "output cap reached, discarding further stdout"
        );
    }
}

async fn read_some(stdout: &mut Option<ChildStdout>, buf: &mut [u8]) -> std::io::Result<usize> {
    match stdout {
        Some(pipe) => pipe.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn read_capped(stderr: Option<ChildStderr>, cap: usize) -> String {
    let Some(mut pipe) = stderr else {
        return String::new();
    };
    let mut captured = CappedBuffer::new(cap);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                captured.write(&buf[..n]);
            }
        }
    }
    captured.to_string_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::with_limits(Duration::from_millis(300), 1024)
    }

    fn sh(script: &str, timeout: Duration) -> RunSpec {
        RunSpec::new("sh", std::env::temp_dir(), timeout)
            .arg("-c")
            .arg(script)
    }

    async fn drain(mut process: RunningProcess) -> (Vec<u8>, ProcessExit) {
        let mut stdout = Vec::new();
        while let Some(item) = process.recv().await {
            match item {
                ProcessOutput::Stdout(chunk) => stdout.extend(chunk),
                ProcessOutput::Exit(exit) => return (stdout, exit),
            }
        }
        panic!("process channel closed without an exit report");
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let runner = runner();
        let process = runner
            .spawn("ses-1", &sh("echo out; echo err >&2; exit 3", Duration::from_secs(5)))
            .unwrap();

        let (stdout, exit) = drain(process).await;
        assert_eq!(String::from_utf8_lossy(&stdout), "out\n");
        assert_eq!(exit.stderr.trim(), "err");
        assert_eq!(exit.exit_code(), Some(3));
        assert!(!exit.truncated);
        assert!(runner.table().is_empty());
    }

    #[tokio::test]
    async fn environment_overrides_reach_the_child() {
        let runner = runner();
        let spec = sh("printf %s \"$ATELIER_TEST\"", Duration::from_secs(5)).env("ATELIER_TEST", "ok");
        let (stdout, _) = drain(runner.spawn("ses-1", &spec).unwrap()).await;
        assert_eq!(stdout, b"ok");
    }

    #[tokio::test]
    async fn stdin_is_closed() {
        let runner = runner();
        // `cat` would block forever on an open stdin
        let (stdout, exit) = drain(runner.spawn("ses-1", &sh("cat; echo done", Duration::from_secs(5))).unwrap()).await;
        assert_eq!(String::from_utf8_lossy(&stdout), "done\n");
        assert_eq!(exit.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn output_past_the_cap_is_discarded_but_process_runs_on() {
        let runner = ProcessRunner::with_limits(Duration::from_millis(300), 16);
        let spec = sh(
            "i=0; while [ $i -lt 100 ]; do echo line-$i; i=$((i+1)); done; exit 0",
            Duration::from_secs(5),
        );
        let (stdout, exit) = drain(runner.spawn("ses-1", &spec).unwrap()).await;
        assert_eq!(stdout.len(), 16);
        assert!(exit.truncated);
        assert!(exit.stdout_bytes > 16);
        assert_eq!(exit.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn timeout_escalates_and_reports() {
        let runner = runner();
        let process = runner
            .spawn("ses-1", &sh("sleep 10", Duration::from_millis(100)))
            .unwrap();
        let (_, exit) = drain(process).await;
        assert_eq!(exit.termination, Termination::TimedOut { forced: false });
        assert!(exit.timed_out());
        assert!(runner.table().is_empty());
    }

    #[tokio::test]
    async fn timeout_forces_kill_when_sigterm_is_ignored() {
        let runner = runner();
        let process = runner
            .spawn("ses-1", &sh("trap '' TERM; sleep 10", Duration::from_millis(200)))
            .unwrap();
        let (_, exit) = drain(process).await;
        assert_eq!(exit.termination, Termination::TimedOut { forced: true });
    }

    #[tokio::test]
    async fn terminate_through_the_table() {
        let runner = runner();
        let process = runner
            .spawn("ses-1", &sh("sleep 10", Duration::from_secs(30)))
            .unwrap();
        assert!(runner.table().contains("ses-1"));
        assert!(runner.table().terminate("ses-1"));

        let (_, exit) = drain(process).await;
        assert_eq!(exit.termination, Termination::Terminated { forced: false });
        assert!(!runner.table().contains("ses-1"));
    }

    #[tokio::test]
    async fn concurrent_spawn_for_same_session_is_rejected() {
        let runner = runner();
        let first = runner
            .spawn("ses-1", &sh("sleep 10", Duration::from_secs(30)))
            .unwrap();
        let second = runner.spawn("ses-1", &sh("echo hi", Duration::from_secs(30)));
        assert!(matches!(second, Err(AtelierError::SessionBusy(_))));

        assert_eq!(runner.table().kill_all(), 1);
        let (_, exit) = drain(first).await;
        assert_eq!(exit.termination, Termination::Killed);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let runner = runner();
        let spec = RunSpec::new("definitely-not-an-agent-cli", std::env::temp_dir(), Duration::from_secs(1));
        let err = runner.spawn("ses-1", &spec).unwrap_err();
        assert!(matches!(err, AtelierError::ProcessSpawn(_)));
        assert!(runner.table().is_empty());
    }

    #[tokio::test]
    async fn exit_is_seen_while_a_background_child_holds_stdout() {
        let runner = runner();
        let mut process = runner
            .spawn("ses-1", &sh("sleep 5 & echo answer; exit 0", Duration::from_secs(10)))
            .unwrap();
        let started = Instant::now();

        match process.recv().await {
            Some(ProcessOutput::Stdout(chunk)) => assert_eq!(chunk, b"answer\n"),
            other => panic!("expected stdout first, got {:?}", other),
        }

        // Slot is freed as soon as sh is reaped, before the pipes drain
        let mut freed = false;
        for _ in 0..25 {
            if runner.table().is_empty() {
                freed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(freed, "table still holds an exited process");

        let (rest, exit) = drain(process).await;
        assert!(rest.is_empty());
        assert_eq!(exit.termination, Termination::Exited { code: Some(0) });
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn abandoned_process_still_deregisters() {
        let runner = runner();
        let process = runner
            .spawn("ses-1", &sh("exit 0", Duration::from_secs(5)))
            .unwrap();
        drop(process);

        for _ in 0..50 {
            if runner.table().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("table still holds an exited process");
    }
}
