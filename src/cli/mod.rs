//! CLI command definitions

use crate::config::AppConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Uniform sessions over command-line AI agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub limits: Limits,
}

/// Registry knobs, each overridable from the environment
#[derive(Args, Debug, Clone)]
pub struct Limits {
    /// Sessions kept before the least recently active is evicted
    #[arg(long, global = true, env = "ATELIER_MAX_SESSIONS", default_value_t = crate::config::DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,

    /// Idle seconds before a session is evicted
    #[arg(long, global = true, env = "ATELIER_SESSION_TIMEOUT_SECS", default_value_t = 30 * 60)]
    pub session_timeout_secs: u64,

    /// Seconds between idle sweeps
    #[arg(long, global = true, env = "ATELIER_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Bytes of agent output kept per message
    #[arg(long, global = true, env = "ATELIER_MAX_OUTPUT_BYTES", default_value_t = crate::config::DEFAULT_MAX_OUTPUT_BYTES)]
    pub max_output_bytes: usize,

    /// Milliseconds between SIGTERM and SIGKILL
    #[arg(long, global = true, env = "ATELIER_KILL_GRACE_MS", default_value_t = 2000)]
    pub kill_grace_ms: u64,
}

impl Limits {
    pub fn to_config(&self) -> AppConfig {
        AppConfig::default()
            .with_max_sessions(self.max_sessions)
            .with_session_timeout(Duration::from_secs(self.session_timeout_secs))
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs))
            .with_max_output_bytes(self.max_output_bytes)
            .with_kill_grace(Duration::from_millis(self.kill_grace_ms))
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// List known adapters and whether their tool is installed
    Adapters,

    /// Send one message through a fresh session
    Send {
        /// Adapter name (claude, codex, gemini, aider)
        adapter: String,

        /// Message to send
        message: String,

        /// Print progress as it arrives
        #[arg(short, long)]
        stream: bool,

        /// Timeout for this message in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Working directory for the agent
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Model override
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Interactive conversation over one session
    Chat {
        /// Adapter name
        adapter: String,

        /// Working directory for the agent
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Model override
        #[arg(short, long)]
        model: Option<String>,
    },
}
