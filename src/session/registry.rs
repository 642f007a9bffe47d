//! Session Registry
//!
//! Single source of truth for which sessions exist and what state they are
//! in. All session map mutations go through this type; terminate, idle
//! eviction, capacity eviction and shutdown share one removal path.

use super::events::{EventBus, RegistryEvent};
use super::sweeper::SweeperHandle;
use super::{
    generate_session_id, CreatedSession, InterruptOutcome, InterruptReason, SendResponse, Session, SessionId,
    SessionSnapshot, SessionStatus, ShutdownReport, StatusReport, TerminationReason,
};
use crate::adapter::{Adapter, AdapterRegistry, SendOptions, SpawnOptions};
use crate::config::AppConfig;
use crate::stream::{AgentEvent, EventStream};
use crate::{AtelierError, ErrorKind, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

struct Inner {
    config: AppConfig,
    adapters: RwLock<AdapterRegistry>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    events: EventBus,
    /// Serializes capacity accounting between concurrent creates
    create_lock: tokio::sync::Mutex<()>,
    /// Creates that passed the capacity check but are not inserted yet
    pending: AtomicUsize,
}

/// The orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

/// Non-owning handle, used by the background sweeper
#[derive(Clone)]
pub struct WeakSessionRegistry {
    inner: Weak<Inner>,
}

impl WeakSessionRegistry {
    pub fn upgrade(&self) -> Option<SessionRegistry> {
        self.inner.upgrade().map(|inner| SessionRegistry { inner })
    }
}

/// Holds a capacity slot until the session is inserted or creation fails
struct Reservation<'a>(&'a AtomicUsize);

impl<'a> Reservation<'a> {
    fn new(pending: &'a AtomicUsize) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self(pending)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A session's in-flight claim. Whoever holds it last settles the session,
/// so a caller dropped mid-send cannot leave it busy.
struct SendClaim {
    registry: SessionRegistry,
    session_id: SessionId,
    started: Instant,
    /// Status written back on release
    outcome: SessionStatus,
}

impl Drop for SendClaim {
    fn drop(&mut self) {
        self.registry
            .finish_send(&self.session_id, self.outcome, self.started);
    }
}

impl SessionRegistry {
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_adapters(config, AdapterRegistry::new())
    }

    pub fn with_adapters(config: AppConfig, adapters: AdapterRegistry) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                adapters: RwLock::new(adapters),
                sessions: Mutex::new(HashMap::new()),
                events,
                create_lock: tokio::sync::Mutex::new(()),
                pending: AtomicUsize::new(0),
            }),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakSessionRegistry {
        WeakSessionRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Receive every registry signal emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) {
        let name = adapter.name().to_string();
        let replaced = self
            .inner
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(adapter)
            .is_some();
        tracing::info!(adapter = %name, replaced, "adapter registered");
        self.emit(RegistryEvent::AdapterRegistered { adapter: name });
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters().get(name)
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters().names()
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Create a session bound to `adapter_name`.
    ///
    /// At capacity, the least-recently-active session is terminated first.
    pub async fn create_session(&self, adapter_name: &str, options: SpawnOptions) -> Result<CreatedSession> {
        let adapter = self
            .adapter(adapter_name)
            .ok_or_else(|| AtelierError::AdapterNotFound(adapter_name.to_string()))?;
        if !adapter.is_available().await {
            return Err(AtelierError::AdapterUnavailable(adapter_name.to_string()));
        }

        let _reservation = {
            let _guard = self.inner.create_lock.lock().await;
            self.make_room().await?;
            Reservation::new(&self.inner.pending)
        };

        let session_id = generate_session_id();
        let mut options = options;
        if options.working_dir.is_none() {
            options.working_dir = Some(self.inner.config.resolve_working_dir());
        }

        let started = adapter.spawn(&session_id, &options).await?;
        let session = Session::new(session_id.clone(), adapter_name.to_string(), started.working_dir.clone());
        self.sessions().insert(session_id.clone(), session);

        tracing::info!(
            session_id = %session_id,
            adapter = adapter_name,
            init_mode = ?adapter.init_mode(),
            working_dir = %started.working_dir.display(),
            "session created"
        );
        self.emit(RegistryEvent::SessionCreated {
            session_id: session_id.clone(),
            adapter: adapter_name.to_string(),
        });

        Ok(CreatedSession {
            session_id,
            status: SessionStatus::Stable,
            working_dir: started.working_dir,
            resume_token: started.resume_token,
        })
    }

    /// Send a message and collect every event.
    ///
    /// An `error` event becomes the returned error; the session stays
    /// registered with status `error`.
    pub async fn send(&self, session_id: &str, message: &str, options: SendOptions) -> Result<SendResponse> {
        let events = self
            .send_stream(session_id, message, options)
            .await?
            .collect_events()
            .await;

        if let Some(err) = events.iter().find_map(AgentEvent::to_error) {
            return Err(err);
        }
        let result = match events.last() {
            Some(AgentEvent::Final(result)) => result.clone(),
            _ => {
                return Err(AtelierError::Reported {
                    kind: ErrorKind::ProcessExitError,
                    message: "event stream ended without a result".to_string(),
                })
            }
        };

        Ok(SendResponse {
            session_id: session_id.to_string(),
            content: result.content,
            usage: result.usage,
            resume_token: result.resume_token,
            truncated: result.truncated,
            events,
        })
    }

    /// Send a message and surface events as they are produced.
    ///
    /// Status bookkeeping completes when the adapter's stream ends, whether
    /// or not the returned stream is consumed; the returned stream closes
    /// only after the status has been updated.
    pub async fn send_stream(&self, session_id: &str, message: &str, options: SendOptions) -> Result<EventStream> {
        let adapter_name = {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
            if session.in_flight {
                return Err(AtelierError::SessionBusy(session_id.to_string()));
            }
            session.in_flight = true;
            session.status = SessionStatus::Running;
            session.message_count += 1;
            session.last_activity = Utc::now();
            session.adapter.clone()
        };
        let mut claim = SendClaim {
            registry: self.clone(),
            session_id: session_id.to_string(),
            started: Instant::now(),
            outcome: SessionStatus::Error,
        };

        let Some(adapter) = self.adapter(&adapter_name) else {
            return Err(AtelierError::AdapterNotFound(adapter_name));
        };

        let mut upstream = match adapter.send(session_id, message, &options).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(session_id, adapter = %adapter_name, "send failed: {}", e);
                return Err(e);
            }
        };

        let (tx, stream) = EventStream::channel();
        let registry = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = upstream.recv().await {
                match &event {
                    AgentEvent::Final(_) => claim.outcome = SessionStatus::Stable,
                    AgentEvent::Error { message, .. } => {
                        tracing::warn!(session_id = %session_id, "send ended with error: {}", message);
                        claim.outcome = SessionStatus::Error;
                    }
                    _ => {}
                }
                registry.emit(RegistryEvent::Chunk {
                    session_id: session_id.clone(),
                    event: event.clone(),
                });
                // A caller that stopped listening does not stop bookkeeping
                let _ = tx.send(event);
            }
            // Settle the session before the caller's stream closes
            drop(claim);
            drop(tx);
        });

        Ok(stream)
    }

    fn finish_send(&self, session_id: &str, status: SessionStatus, started: Instant) {
        let updated = match self.sessions().get_mut(session_id) {
            Some(session) => {
                session.status = status;
                session.in_flight = false;
                session.last_activity = Utc::now();
                true
            }
            None => false,
        };
        if updated {
            let duration_ms = started.elapsed().as_millis() as u64;
            tracing::debug!(session_id, %status, duration_ms, "send finished");
            self.emit(RegistryEvent::MessageSent {
                session_id: session_id.to_string(),
                status,
                duration_ms,
            });
        }
    }

    /// Ask the session's running process to stop gracefully.
    ///
    /// Missing sessions and idle sessions are reported, not errors.
    pub async fn interrupt(&self, session_id: &str) -> Result<InterruptOutcome> {
        let Some((adapter_name, previous)) = self
            .sessions()
            .get(session_id)
            .map(|s| (s.adapter.clone(), s.status))
        else {
            return Ok(InterruptOutcome::skipped(InterruptReason::SessionNotFound, None));
        };

        let adapter = match self.adapter(&adapter_name) {
            Some(adapter) if adapter.is_session_active(session_id) => adapter,
            _ => {
                return Ok(InterruptOutcome::skipped(
                    InterruptReason::NoActiveProcess,
                    Some(previous),
                ))
            }
        };

        if !adapter.interrupt(session_id).await? {
            return Ok(InterruptOutcome::skipped(
                InterruptReason::NoActiveProcess,
                Some(previous),
            ));
        }

        if let Some(session) = self.sessions().get_mut(session_id) {
            session.status = SessionStatus::Stable;
            session.last_activity = Utc::now();
        }
        tracing::info!(session_id, previous_status = %previous, "session interrupted");
        self.emit(RegistryEvent::SessionInterrupted {
            session_id: session_id.to_string(),
            previous_status: previous,
        });

        Ok(InterruptOutcome {
            interrupted: true,
            reason: None,
            previous_status: Some(previous),
        })
    }

    /// Pure read of a session's state
    pub fn get_status(&self, session_id: &str) -> Result<StatusReport> {
        let session = self
            .sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        let now = Utc::now();
        Ok(StatusReport {
            status: session.status,
            last_activity: session.last_activity,
            message_count: session.message_count,
            has_active_process: self.has_active_process(&session),
            idle_ms: session.idle(now).as_millis() as u64,
        })
    }

    /// All sessions, oldest first
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<Session> = self.sessions().values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
            .into_iter()
            .map(|s| SessionSnapshot {
                has_active_process: self.has_active_process(&s),
                session_id: s.id,
                adapter: s.adapter,
                working_dir: s.working_dir,
                status: s.status,
                created_at: s.created_at,
                last_activity: s.last_activity,
                message_count: s.message_count,
            })
            .collect()
    }

    /// Terminate a session. `false` if it did not exist.
    pub async fn terminate_session(&self, session_id: &str) -> bool {
        self.terminate_with_reason(session_id, TerminationReason::Explicit)
            .await
            .is_some()
    }

    /// Remove bookkeeping, then stop the adapter side.
    ///
    /// `None` if the session did not exist. Adapter failures are logged and
    /// emitted but the session is gone regardless.
    async fn terminate_with_reason(&self, session_id: &str, reason: TerminationReason) -> Option<Result<()>> {
        self.terminate_if(session_id, reason, |_| true).await
    }

    /// Like `terminate_with_reason`, but only if `still_wanted` holds for the
    /// session at the moment it is removed.
    async fn terminate_if(
        &self,
        session_id: &str,
        reason: TerminationReason,
        still_wanted: impl FnOnce(&Session) -> bool,
    ) -> Option<Result<()>> {
        let session = {
            let mut sessions = self.sessions();
            if !still_wanted(sessions.get(session_id)?) {
                return None;
            }
            sessions.remove(session_id)?
        };

        let cleanup = match self.adapter(&session.adapter) {
            Some(adapter) => adapter.terminate(session_id).await,
            None => Ok(()),
        };
        if let Err(e) = &cleanup {
            tracing::warn!(session_id, adapter = %session.adapter, "adapter cleanup failed: {}", e);
            self.emit(RegistryEvent::CleanupError {
                session_id: Some(session_id.to_string()),
                message: e.to_string(),
            });
        }

        tracing::info!(session_id, adapter = %session.adapter, %reason, "session terminated");
        self.emit(RegistryEvent::SessionTerminated {
            session_id: session_id.to_string(),
            adapter: session.adapter,
            reason,
        });
        Some(cleanup)
    }

    /// Evict the least-recently-active sessions until a new one fits.
    async fn make_room(&self) -> Result<()> {
        let max = self.inner.config.max_sessions;
        loop {
            let victim = {
                let sessions = self.sessions();
                if sessions.len() + self.inner.pending.load(Ordering::SeqCst) < max {
                    return Ok(());
                }
                sessions
                    .values()
                    .min_by_key(|s| s.last_activity)
                    .map(|s| s.id.clone())
            };

            // Every slot is held by a create still in progress
            let Some(victim) = victim else {
                tracing::warn!(max_sessions = max, "no session available to evict");
                return Err(AtelierError::CapacityExceeded(max));
            };

            tracing::info!(session_id = %victim, max_sessions = max, "evicting session for capacity");
            self.emit(RegistryEvent::SessionEvictedForCapacity {
                session_id: victim.clone(),
            });
            self.terminate_with_reason(&victim, TerminationReason::Capacity).await;
        }
    }

    /// Terminate sessions idle past the configured timeout.
    ///
    /// Sessions with a send in flight are skipped. Returns the evicted ids.
    pub async fn sweep_idle(&self) -> Vec<SessionId> {
        let timeout = self.inner.config.session_timeout;
        let now = Utc::now();
        let expired: Vec<(SessionId, Duration)> = self
            .sessions()
            .values()
            .filter(|s| !s.in_flight)
            .filter_map(|s| {
                let idle = s.idle(now);
                (idle > timeout).then(|| (s.id.clone(), idle))
            })
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for (session_id, idle) in expired {
            // A send may have started while earlier candidates were removed
            let still_idle = |s: &Session| !s.in_flight && s.idle(Utc::now()) > timeout;
            if self
                .terminate_if(&session_id, TerminationReason::IdleTimeout, still_idle)
                .await
                .is_some()
            {
                tracing::info!(session_id = %session_id, idle_ms = idle.as_millis() as u64, "idle session evicted");
                self.emit(RegistryEvent::SessionTimeoutEvicted {
                    session_id: session_id.clone(),
                    idle_ms: idle.as_millis() as u64,
                });
                evicted.push(session_id);
            }
        }
        evicted
    }

    /// Run `sweep_idle` every `sweep_interval` until the handle is dropped
    pub fn start_sweeper(&self) -> SweeperHandle {
        SweeperHandle::spawn(self)
    }

    /// Terminate every session, then make every adapter kill what is left.
    pub async fn shutdown(&self) -> ShutdownReport {
        let ids: Vec<SessionId> = self.sessions().keys().cloned().collect();
        let mut report = ShutdownReport::default();

        for session_id in ids {
            match self
                .terminate_with_reason(&session_id, TerminationReason::Shutdown)
                .await
            {
                Some(Ok(())) => report.terminated += 1,
                Some(Err(e)) => {
                    report.terminated += 1;
                    report.errors.push(format!("{}: {}", session_id, e));
                }
                None => {}
            }
        }

        for adapter in self.adapters().all() {
            adapter.kill_all_processes().await;
        }

        tracing::info!(
            terminated = report.terminated,
            errors = report.errors.len(),
            "session registry shut down"
        );
        report
    }

    fn has_active_process(&self, session: &Session) -> bool {
        self.adapter(&session.adapter)
            .is_some_and(|adapter| adapter.is_session_active(&session.id))
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn adapters(&self) -> AdapterRegistry {
        self.inner
            .adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: RegistryEvent) {
        self.inner.events.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterSession;
    use crate::stream::FinalResult;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    /// Adapter that answers instantly without spawning anything
    struct InstantAdapter {
        available: AtomicBool,
        fail: AtomicBool,
        terminated: Mutex<Vec<String>>,
        /// How long `send` takes before handing back a stream
        send_delay: Mutex<Duration>,
        terminate_delay: Mutex<Duration>,
    }

    impl InstantAdapter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                available: AtomicBool::new(true),
                fail: AtomicBool::new(false),
                terminated: Mutex::new(Vec::new()),
                send_delay: Mutex::new(Duration::ZERO),
                terminate_delay: Mutex::new(Duration::ZERO),
            })
        }
    }

    #[async_trait]
    impl Adapter for InstantAdapter {
        fn name(&self) -> &str {
            "instant"
        }

        fn default_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        async fn spawn(&self, session_id: &str, options: &SpawnOptions) -> Result<AdapterSession> {
            Ok(AdapterSession {
                session_id: session_id.to_string(),
                working_dir: options.working_dir.clone().unwrap_or_default(),
                model: None,
                resume_token: None,
            })
        }

        async fn send(&self, _session_id: &str, message: &str, _options: &SendOptions) -> Result<EventStream> {
            let delay = *self.send_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Ok(EventStream::from_events([AgentEvent::error(
                    ErrorKind::ProcessExitError,
                    "exit 1",
                )]));
            }
            Ok(EventStream::from_events([
                AgentEvent::text(message),
                AgentEvent::Final(FinalResult {
                    content: message.to_string(),
                    ..Default::default()
                }),
            ]))
        }

        async fn interrupt(&self, _session_id: &str) -> Result<bool> {
            Ok(false)
        }

        async fn terminate(&self, session_id: &str) -> Result<()> {
            let delay = *self.terminate_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            self.terminated.lock().unwrap().push(session_id.to_string());
            Ok(())
        }

        fn is_session_active(&self, _session_id: &str) -> bool {
            false
        }

        fn active_sessions(&self) -> Vec<SessionId> {
            Vec::new()
        }

        async fn kill_all_processes(&self) {}
    }

    fn registry(max_sessions: usize) -> (SessionRegistry, Arc<InstantAdapter>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::default()
            .with_max_sessions(max_sessions)
            .with_default_working_dir(dir.path());
        let registry = SessionRegistry::new(config).unwrap();
        let adapter = InstantAdapter::new();
        registry.register_adapter(adapter.clone());
        (registry, adapter, dir)
    }

    #[tokio::test]
    async fn create_requires_known_available_adapter() {
        let (registry, adapter, _dir) = registry(4);

        let err = registry
            .create_session("nope", SpawnOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterNotFound);

        adapter.available.store(false, Ordering::SeqCst);
        let err = registry
            .create_session("instant", SpawnOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterUnavailable);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn created_sessions_start_stable_in_the_default_dir() {
        let (registry, _adapter, dir) = registry(4);
        let created = registry
            .create_session("instant", SpawnOptions::default())
            .await
            .unwrap();
        assert_eq!(created.status, SessionStatus::Stable);
        assert_eq!(created.working_dir, dir.path());

        let status = registry.get_status(&created.session_id).unwrap();
        assert_eq!(status.message_count, 0);
        assert!(!status.has_active_process);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (registry, adapter, _dir) = registry(4);
        let id = registry
            .create_session("instant", SpawnOptions::default())
            .await
            .unwrap()
            .session_id;

        assert!(registry.terminate_session(&id).await);
        assert!(!registry.terminate_session(&id).await);
        assert_eq!(adapter.terminated.lock().unwrap().as_slice(), [id.clone()]);
        assert!(matches!(
            registry.get_status(&id),
            Err(AtelierError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn send_updates_status_and_count() {
        let (registry, adapter, _dir) = registry(4);
        let id = registry
            .create_session("instant", SpawnOptions::default())
            .await
            .unwrap()
            .session_id;

        let response = registry.send(&id, "hello", SendOptions::default()).await.unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.events.len(), 2);
        let status = registry.get_status(&id).unwrap();
        assert_eq!(status.status, SessionStatus::Stable);
        assert_eq!(status.message_count, 1);

        adapter.fail.store(true, Ordering::SeqCst);
        let err = registry.send(&id, "again", SendOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessExitError);
        let status = registry.get_status(&id).unwrap();
        assert_eq!(status.status, SessionStatus::Error);
        assert_eq!(status.message_count, 2);
    }

    #[tokio::test]
    async fn send_to_unknown_session_fails() {
        let (registry, _adapter, _dir) = registry(4);
        let err = registry
            .send("ses-missing", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn cancelled_send_does_not_leave_session_busy() {
        let (registry, adapter, _dir) = registry(4);
        let id = registry
            .create_session("instant", SpawnOptions::default())
            .await
            .unwrap()
            .session_id;

        *adapter.send_delay.lock().unwrap() = Duration::from_millis(200);
        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            registry.send_stream(&id, "slow start", SendOptions::default()),
        )
        .await;
        assert!(cancelled.is_err());

        let status = registry.get_status(&id).unwrap();
        assert_eq!(status.status, SessionStatus::Error);
        assert_eq!(status.message_count, 1);

        *adapter.send_delay.lock().unwrap() = Duration::ZERO;
        let response = registry.send(&id, "again", SendOptions::default()).await.unwrap();
        assert_eq!(response.content, "again");
        assert_eq!(registry.get_status(&id).unwrap().status, SessionStatus::Stable);
    }

    #[tokio::test]
    async fn idle_sweep_spares_a_session_whose_send_started_mid_sweep() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::default()
            .with_session_timeout(Duration::from_millis(100))
            .with_default_working_dir(dir.path());
        let registry = SessionRegistry::new(config).unwrap();
        let adapter = InstantAdapter::new();
        registry.register_adapter(adapter.clone());

        for _ in 0..2 {
            registry
                .create_session("instant", SpawnOptions::default())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The first removal stalls, leaving a window before the second
        *adapter.terminate_delay.lock().unwrap() = Duration::from_millis(200);
        *adapter.send_delay.lock().unwrap() = Duration::from_secs(1);
        let sweep = tokio::spawn({
            let registry = registry.clone();
            async move { registry.sweep_idle().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let survivors = registry.list_sessions();
        assert_eq!(survivors.len(), 1);
        let busy = survivors[0].session_id.clone();
        let send = tokio::spawn({
            let registry = registry.clone();
            let busy = busy.clone();
            async move { registry.send(&busy, "late", SendOptions::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let evicted = sweep.await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert!(!evicted.contains(&busy));
        assert_eq!(registry.get_status(&busy).unwrap().status, SessionStatus::Running);

        assert_eq!(send.await.unwrap().unwrap().content, "late");
    }

    #[tokio::test]
    async fn interrupt_reports_instead_of_failing() {
        let (registry, _adapter, _dir) = registry(4);
        let outcome = registry.interrupt("ses-missing").await.unwrap();
        assert!(!outcome.interrupted);
        assert_eq!(outcome.reason, Some(InterruptReason::SessionNotFound));

        let id = registry
            .create_session("instant", SpawnOptions::default())
            .await
            .unwrap()
            .session_id;
        let outcome = registry.interrupt(&id).await.unwrap();
        assert!(!outcome.interrupted);
        assert_eq!(outcome.reason, Some(InterruptReason::NoActiveProcess));
        assert_eq!(outcome.previous_status, Some(SessionStatus::Stable));
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_active() {
        let (registry, _adapter, _dir) = registry(2);
        let mut events = registry.subscribe();

        let first = registry
            .create_session("instant", SpawnOptions::default())
            .await
            .unwrap()
            .session_id;
        let second = registry
            .create_session("instant", SpawnOptions::default())
            .await
            .unwrap()
            .session_id;
        // Touch the first so the second becomes the oldest by activity
        registry.send(&first, "ping", SendOptions::default()).await.unwrap();

        let third = registry
            .create_session("instant", SpawnOptions::default())
            .await
            .unwrap()
            .session_id;

        let ids: Vec<String> = registry
            .list_sessions()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first));
        assert!(ids.contains(&third));
        assert!(!ids.contains(&second));

        let mut saw_capacity_eviction = false;
        while let Ok(event) = events.try_recv() {
            if event == (RegistryEvent::SessionEvictedForCapacity { session_id: second.clone() }) {
                saw_capacity_eviction = true;
            }
        }
        assert!(saw_capacity_eviction);
    }

    #[tokio::test]
    async fn idle_sweep_evicts_with_distinct_signal() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::default()
            .with_session_timeout(Duration::from_millis(20))
            .with_default_working_dir(dir.path());
        let registry = SessionRegistry::new(config).unwrap();
        registry.register_adapter(InstantAdapter::new());
        let mut events = registry.subscribe();

        let id = registry
            .create_session("instant", SpawnOptions::default())
            .await
            .unwrap()
            .session_id;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(registry.sweep_idle().await, vec![id.clone()]);
        assert!(registry.list_sessions().is_empty());

        let mut reasons = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                RegistryEvent::SessionTerminated { reason, .. } => reasons.push(reason),
                RegistryEvent::SessionTimeoutEvicted { session_id, .. } => assert_eq!(session_id, id),
                _ => {}
            }
        }
        assert_eq!(reasons, vec![TerminationReason::IdleTimeout]);
    }

    #[tokio::test]
    async fn shutdown_terminates_everything() {
        let (registry, adapter, _dir) = registry(4);
        for _ in 0..3 {
            registry
                .create_session("instant", SpawnOptions::default())
                .await
                .unwrap();
        }
        let report = registry.shutdown().await;
        assert_eq!(report.terminated, 3);
        assert!(report.errors.is_empty());
        assert_eq!(registry.session_count(), 0);
        assert_eq!(adapter.terminated.lock().unwrap().len(), 3);
    }
}
