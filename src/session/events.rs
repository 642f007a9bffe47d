//! Registry signals and their broadcast fan-out

use super::{SessionId, SessionStatus, TerminationReason};
use crate::stream::AgentEvent;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Something observable happened in the registry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    SessionCreated {
        session_id: SessionId,
        adapter: String,
    },
    MessageSent {
        session_id: SessionId,
        status: SessionStatus,
        duration_ms: u64,
    },
    SessionInterrupted {
        session_id: SessionId,
        previous_status: SessionStatus,
    },
    SessionTerminated {
        session_id: SessionId,
        adapter: String,
        reason: TerminationReason,
    },
    SessionTimeoutEvicted {
        session_id: SessionId,
        idle_ms: u64,
    },
    SessionEvictedForCapacity {
        session_id: SessionId,
    },
    /// One normalized event of an in-flight send
    Chunk {
        session_id: SessionId,
        event: AgentEvent,
    },
    AdapterRegistered {
        adapter: String,
    },
    CleanupError {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        message: String,
    },
}

impl RegistryEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            RegistryEvent::SessionCreated { session_id, .. }
            | RegistryEvent::MessageSent { session_id, .. }
            | RegistryEvent::SessionInterrupted { session_id, .. }
            | RegistryEvent::SessionTerminated { session_id, .. }
            | RegistryEvent::SessionTimeoutEvicted { session_id, .. }
            | RegistryEvent::SessionEvictedForCapacity { session_id }
            | RegistryEvent::Chunk { session_id, .. } => Some(session_id.as_str()),
            RegistryEvent::CleanupError { session_id, .. } => session_id.as_deref(),
            RegistryEvent::AdapterRegistered { .. } => None,
        }
    }
}

/// Broadcast source for [`RegistryEvent`]s.
///
/// `emit` never waits; a subscriber that falls behind by more than the
/// channel capacity sees `Lagged` instead of slowing the registry down.
pub struct EventBus {
    tx: broadcast::Sender<RegistryEvent>,
    emit_count: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Returns the number of subscribers that received the event.
    pub fn emit(&self, event: RegistryEvent) -> usize {
        self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        let count = bus.emit(RegistryEvent::AdapterRegistered {
            adapter: "claude".to_string(),
        });
        assert_eq!(count, 0);
        assert_eq!(bus.emit_count(), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(RegistryEvent::SessionEvictedForCapacity {
            session_id: "ses-1".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), Some("ses-1"));
    }

    #[test]
    fn events_are_tagged_by_type() {
        let event = RegistryEvent::Chunk {
            session_id: "ses-1".to_string(),
            event: AgentEvent::text("hi"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chunk");
        assert_eq!(json["event"]["kind"], "progress:text");
    }

    #[tokio::test]
    async fn slow_subscribers_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.emit(RegistryEvent::SessionEvictedForCapacity {
                session_id: format!("ses-{}", i),
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
