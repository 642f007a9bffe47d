//! Process-backed adapter, parameterised per tool
//!
//! Each supported CLI differs only in how its arguments are built and which
//! output dialect it speaks, so one [`CommandAdapter`] driven by a
//! [`CommandProfile`] covers all of them.

use super::{Adapter, AdapterSession, InitMode, SendOptions, SpawnOptions};
use crate::config::AppConfig;
use crate::process::{ProcessRunner, RunSpec};
use crate::session::SessionId;
use crate::stream::{self, AgentEvent, Dialect, EventStream, Normalizer};
use crate::{AtelierError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Command;

/// Upper bound on the availability probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the message goes on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptPlacement {
    /// Last positional argument
    Trailing,
    /// Value of a flag, e.g. `--message`
    Flag(String),
}

/// Argument dialect of one agent CLI
#[derive(Debug, Clone)]
pub struct CommandProfile {
    pub name: String,
    pub program: String,
    pub base_args: Vec<String>,
    pub prompt: PromptPlacement,
    /// Emitted as `<flag> <token>` when the session has a resumption token
    pub resume_flag: Option<String>,
    pub model_flag: Option<String>,
    /// Emitted as `<flag> a,b,c`. The flag may be variadic, so a trailing
    /// prompt right after it is separated with `--`.
    pub allowed_tools_flag: Option<String>,
    /// Arguments for the availability probe
    pub version_args: Vec<String>,
    pub dialect: Dialect,
    pub default_timeout: Duration,
    /// Run once at spawn to establish a resumable context
    pub init_prompt: Option<String>,
    pub env: Vec<(String, String)>,
}

impl CommandProfile {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            base_args: Vec::new(),
            prompt: PromptPlacement::Trailing,
            resume_flag: None,
            model_flag: None,
            allowed_tools_flag: None,
            version_args: vec!["--version".to_string()],
            dialect: Dialect::PlainText,
            default_timeout: Duration::from_secs(5 * 60),
            init_prompt: None,
            env: Vec::new(),
        }
    }

    /// Claude Code in print mode, streaming JSON
    pub fn claude() -> Self {
        Self::new("claude", "claude")
            .base_args(["-p", "--output-format", "stream-json", "--verbose"])
            .resume_flag("--resume")
            .model_flag("--model")
            .allowed_tools_flag("--allowedTools")
            .dialect(Dialect::JsonLines)
            .default_timeout(Duration::from_secs(30 * 60))
    }

    /// Codex non-interactive `exec` with JSON events
    pub fn codex() -> Self {
        Self::new("codex", "codex")
            .base_args(["exec", "--json", "--skip-git-repo-check"])
            .resume_flag("resume")
            .model_flag("--model")
            .dialect(Dialect::JsonLines)
            .default_timeout(Duration::from_secs(30 * 60))
    }

    pub fn gemini() -> Self {
        Self::new("gemini", "gemini")
            .base_args(["--output-format", "stream-json"])
            .prompt_flag("--prompt")
            .resume_flag("--resume")
            .model_flag("--model")
            .allowed_tools_flag("--allowed-tools")
            .dialect(Dialect::JsonLines)
            .default_timeout(Duration::from_secs(10 * 60))
    }

    /// Aider single-message mode; plain text, no resumable context
    pub fn aider() -> Self {
        Self::new("aider", "aider")
            .base_args(["--no-pretty", "--no-stream", "--yes-always"])
            .prompt_flag("--message")
            .model_flag("--model")
            .dialect(Dialect::PlainText)
            .default_timeout(Duration::from_secs(5 * 60))
    }

    pub fn builtin() -> Vec<CommandProfile> {
        vec![Self::claude(), Self::codex(), Self::gemini(), Self::aider()]
    }

    pub fn base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn prompt_flag(mut self, flag: impl Into<String>) -> Self {
        self.prompt = PromptPlacement::Flag(flag.into());
        self
    }

    pub fn resume_flag(mut self, flag: impl Into<String>) -> Self {
        self.resume_flag = Some(flag.into());
        self
    }

    pub fn model_flag(mut self, flag: impl Into<String>) -> Self {
        self.model_flag = Some(flag.into());
        self
    }

    pub fn allowed_tools_flag(mut self, flag: impl Into<String>) -> Self {
        self.allowed_tools_flag = Some(flag.into());
        self
    }

    pub fn version_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.version_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn init_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.init_prompt = Some(prompt.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Full argument list for one invocation
    pub fn args(
        &self,
        message: &str,
        model: Option<&str>,
        allowed_tools: &[String],
        resume_token: Option<&str>,
    ) -> Vec<String> {
        let mut args = self.base_args.clone();
        // True while the last option could still swallow positionals
        let mut variadic_open = false;

        if let (Some(flag), Some(model)) = (&self.model_flag, model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }
        if let Some(flag) = &self.allowed_tools_flag {
            if !allowed_tools.is_empty() {
                args.push(flag.clone());
                args.push(allowed_tools.join(","));
                variadic_open = true;
            }
        }
        match (&self.resume_flag, resume_token) {
            (Some(flag), Some(token)) => {
                args.push(flag.clone());
                args.push(token.to_string());
                variadic_open = false;
            }
            (None, Some(_)) => {
                tracing::debug!(adapter = %self.name, "tool has no resume flag, starting fresh");
            }
            _ => {}
        }

        match &self.prompt {
            PromptPlacement::Trailing => {
                if variadic_open {
                    args.push("--".to_string());
                }
                args.push(message.to_string());
            }
            PromptPlacement::Flag(flag) => {
                args.push(flag.clone());
                args.push(message.to_string());
            }
        }
        args
    }
}

/// Adapter-side state of one session
#[derive(Debug, Clone)]
struct CommandSession {
    working_dir: PathBuf,
    model: Option<String>,
    allowed_tools: Vec<String>,
    resume_token: Option<String>,
    timeout: Option<Duration>,
}

type SessionMap = Arc<Mutex<HashMap<SessionId, CommandSession>>>;

/// Generic adapter that runs one CLI invocation per message
pub struct CommandAdapter {
    profile: CommandProfile,
    runner: ProcessRunner,
    sessions: SessionMap,
    /// Positive probe results are cached; negative ones are retried
    available: AtomicBool,
}

impl CommandAdapter {
    pub fn new(profile: CommandProfile, config: &AppConfig) -> Self {
        Self::with_runner(profile, ProcessRunner::new(config))
    }

    pub fn with_runner(profile: CommandProfile, runner: ProcessRunner) -> Self {
        Self {
            profile,
            runner,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            available: AtomicBool::new(false),
        }
    }

    pub fn profile(&self) -> &CommandProfile {
        &self.profile
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Latest resumption token recorded for the session
    pub fn resume_token(&self, session_id: &str) -> Option<String> {
        self.sessions()
            .get(session_id)
            .and_then(|s| s.resume_token.clone())
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, CommandSession>> {
        lock(&self.sessions)
    }

    fn session(&self, session_id: &str) -> Result<CommandSession> {
        self.sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))
    }

    async fn initialise(&self, session_id: &str, prompt: &str) -> Result<()> {
        tracing::info!(adapter = %self.profile.name, session_id, "running eager init prompt");
        let events = self
            .send(session_id, prompt, &SendOptions::default())
            .await?
            .collect_events()
            .await;
        match events.iter().find_map(AgentEvent::to_error) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn lock(sessions: &Mutex<HashMap<SessionId, CommandSession>>) -> MutexGuard<'_, HashMap<SessionId, CommandSession>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Adapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.profile.name
    }

    fn init_mode(&self) -> InitMode {
        if self.profile.init_prompt.is_some() {
            InitMode::Eager
        } else {
            InitMode::Lazy
        }
    }

    fn default_timeout(&self) -> Duration {
        self.profile.default_timeout
    }

    async fn is_available(&self) -> bool {
        if self.available.load(Ordering::Acquire) {
            return true;
        }

        let mut command = Command::new(&self.profile.program);
        command
            .args(&self.profile.version_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let available = match tokio::time::timeout(PROBE_TIMEOUT, command.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!(adapter = %self.profile.name, "probe failed to start: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!(adapter = %self.profile.name, "availability probe timed out");
                false
            }
        };

        if available {
            self.available.store(true, Ordering::Release);
        }
        available
    }

    async fn spawn(&self, session_id: &str, options: &SpawnOptions) -> Result<AdapterSession> {
        let working_dir = options
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        if !working_dir.is_dir() {
            return Err(AtelierError::Adapter(format!(
                "working directory {} does not exist",
                working_dir.display()
            )));
        }

        self.sessions().insert(
            session_id.to_string(),
            CommandSession {
                working_dir,
                model: options.model.clone(),
                allowed_tools: options.allowed_tools.clone(),
                resume_token: options.resume_token.clone(),
                timeout: options.timeout,
            },
        );

        if let Some(prompt) = &self.profile.init_prompt {
            if let Err(e) = self.initialise(session_id, prompt).await {
                self.sessions().remove(session_id);
                return Err(e);
            }
        }

        let state = self.session(session_id)?;
        Ok(AdapterSession {
            session_id: session_id.to_string(),
            working_dir: state.working_dir,
            model: state.model,
            resume_token: state.resume_token,
        })
    }

    async fn send(&self, session_id: &str, message: &str, options: &SendOptions) -> Result<EventStream> {
        let state = self.session(session_id)?;
        let model = options.model.as_deref().or(state.model.as_deref());
        let timeout = options
            .timeout
            .or(state.timeout)
            .unwrap_or(self.profile.default_timeout);

        let mut spec = RunSpec::new(&self.profile.program, state.working_dir.clone(), timeout).args(
            self.profile
                .args(message, model, &state.allowed_tools, state.resume_token.as_deref()),
        );
        for (key, value) in &self.profile.env {
            spec = spec.env(key, value);
        }

        let process = self.runner.spawn(session_id, &spec)?;
        tracing::debug!(
            adapter = %self.profile.name,
            session_id,
            pid = process.pid,
            resumed = state.resume_token.is_some(),
            "message sent to agent"
        );

        // Record the token before the final event reaches anyone, so a
        // caller that saw the result can immediately send again.
        let sessions = Arc::clone(&self.sessions);
        let id = session_id.to_string();
        Ok(stream::normalize(process, Normalizer::new(self.profile.dialect), move |event| {
            if let AgentEvent::Final(result) = event {
                if let Some(token) = &result.resume_token {
                    if let Some(state) = lock(&sessions).get_mut(&id) {
                        state.resume_token = Some(token.clone());
                    }
                }
            }
        }))
    }

    async fn interrupt(&self, session_id: &str) -> Result<bool> {
        self.runner.table().interrupt(session_id)
    }

    async fn terminate(&self, session_id: &str) -> Result<()> {
        let known = self.sessions().remove(session_id).is_some();
        let stopping = self.runner.table().terminate(session_id);
        tracing::debug!(adapter = %self.profile.name, session_id, known, stopping, "adapter session terminated");
        Ok(())
    }

    fn is_session_active(&self, session_id: &str) -> bool {
        self.runner.table().contains(session_id)
    }

    fn active_sessions(&self) -> Vec<SessionId> {
        self.runner.table().sessions()
    }

    async fn kill_all_processes(&self) {
        let killed = self.runner.table().kill_all();
        if killed > 0 {
            tracing::info!(adapter = %self.profile.name, killed, "killed all agent processes");
        }
    }
}
