//! Signal delivery and two-phase kill escalation.
//!
//! Every child is spawned as the leader of its own process group, so signals
//! go to the whole group: agent CLIs routinely fork helpers (shells, language
//! servers) that must not outlive the invocation.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

/// Signals the orchestrator sends to agent processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT, the "stop what you are doing" request used by interrupt
    Interrupt,
    /// SIGTERM, the graceful first phase of a kill
    Terminate,
    /// SIGKILL, the forceful second phase
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Interrupt => write!(f, "SIGINT"),
            Signal::Terminate => write!(f, "SIGTERM"),
            Signal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Send a signal to the process group led by `pid`.
///
/// Returns `Ok(false)` when nothing by that id exists any more, which callers
/// treat as "already exited" rather than an error.
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<bool> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("pid {} out of range", pid),
        ));
    };

    // Group first, then the bare pid for children spawned without a group
    for target in [-pid, pid] {
        let rc = unsafe { libc::kill(target, signal.raw()) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(false)
}

/// How a kill escalation ended
#[derive(Debug, Clone, Copy)]
pub struct Escalated {
    /// True if the grace window ran out and SIGKILL was needed
    pub forced: bool,
    /// Exit status, if the child had not already been reaped
    pub status: Option<ExitStatus>,
}

/// Graceful-then-forceful termination, parameterised by the grace window.
///
/// SIGTERM first so tools can flush files they are writing; SIGKILL only if
/// the child is still alive once the window closes.
#[derive(Debug, Clone, Copy)]
pub struct KillEscalation {
    grace: Duration,
}

impl KillEscalation {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub async fn run(&self, child: &mut Child) -> io::Result<Escalated> {
        let Some(pid) = child.id() else {
            return Ok(Escalated {
                forced: false,
                status: None,
            });
        };

        match send_signal(pid, Signal::Terminate) {
            Ok(true) => {
                tracing::debug!(pid, grace_ms = self.grace.as_millis() as u64, "sent SIGTERM");
            }
            Ok(false) => {
                let status = child.wait().await?;
                return Ok(Escalated {
                    forced: false,
                    status: Some(status),
                });
            }
            Err(e) => {
                tracing::warn!(pid, "SIGTERM delivery failed, escalating: {}", e);
            }
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => Ok(Escalated {
                forced: false,
                status: Some(status?),
            }),
            Err(_) => {
                tracing::warn!(
                    pid,
                    "process ignored SIGTERM for {}ms, sending SIGKILL",
                    self.grace.as_millis()
                );
                if let Err(e) = send_signal(pid, Signal::Kill) {
                    tracing::warn!(pid, "SIGKILL to process group failed: {}", e);
                }
                // Covers the case where the group signal could not be delivered
                let _ = child.start_kill();
                let status = child.wait().await?;
                Ok(Escalated {
                    forced: true,
                    status: Some(status),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn cooperative_process_exits_on_sigterm() {
        let mut child = spawn_sh("sleep 10");
        let escalation = KillEscalation::new(Duration::from_secs(2));

        let outcome = escalation.run(&mut child).await.unwrap();
        assert!(!outcome.forced);
        assert!(outcome.status.is_some());
    }

    #[tokio::test]
    async fn stubborn_process_gets_sigkill() {
        let mut child = spawn_sh("trap '' TERM; sleep 10");
        // Give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(100)).await;
        let escalation = KillEscalation::new(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let outcome = escalation.run(&mut child).await.unwrap();
        assert!(outcome.forced);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn signal_to_reaped_process_reports_gone() {
        let mut child = spawn_sh("exit 0");
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        assert!(!send_signal(pid, Signal::Interrupt).unwrap());
    }
}
