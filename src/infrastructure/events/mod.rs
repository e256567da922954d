use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domains::sessions::entity::SessionStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClaudeworkEvent {
    SessionAdded,
    SessionRemoved,
    SessionStatusChanged,
    RebaseStateChanged,
    RunStarted,
    RunFinished,
}

impl ClaudeworkEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaudeworkEvent::SessionAdded => "claudework:session-added",
            ClaudeworkEvent::SessionRemoved => "claudework:session-removed",
            ClaudeworkEvent::SessionStatusChanged => "claudework:session-status-changed",
            ClaudeworkEvent::RebaseStateChanged => "claudework:rebase-state-changed",
            ClaudeworkEvent::RunStarted => "claudework:run-started",
            ClaudeworkEvent::RunFinished => "claudework:run-finished",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EventPayload {
    Session {
        session_id: String,
        name: String,
    },
    Status {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Rebase {
        session_id: String,
        in_progress: bool,
        conflicts: Vec<String>,
    },
    Run {
        run_id: String,
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmittedEvent {
    pub event: ClaudeworkEvent,
    pub name: &'static str,
    pub payload: EventPayload,
}

/// Where the core reports lifecycle transitions for the persistence/UI layer.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ClaudeworkEvent, payload: EventPayload);
}

/// Fans events out to any number of subscribers. Emitting with no
/// subscriber is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<EmittedEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmittedEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: ClaudeworkEvent, payload: EventPayload) {
        log::debug!("Emitting {}: {payload:?}", event.as_str());
        let _ = self.sender.send(EmittedEvent {
            event,
            name: event.as_str(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_namespaced() {
        assert_eq!(
            ClaudeworkEvent::SessionStatusChanged.as_str(),
            "claudework:session-status-changed"
        );
        assert_eq!(ClaudeworkEvent::RunFinished.as_str(), "claudework:run-finished");
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();
        sink.emit(
            ClaudeworkEvent::SessionStatusChanged,
            EventPayload::Status {
                session_id: "s1".into(),
                from: SessionStatus::Initializing,
                to: SessionStatus::Running,
                error: None,
            },
        );
        let received = rx.recv().await.unwrap();
        assert_eq!(received.name, "claudework:session-status-changed");
        let json = serde_json::to_value(&received.payload).unwrap();
        assert_eq!(json["to"], "running");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        BroadcastEventSink::default().emit(
            ClaudeworkEvent::SessionRemoved,
            EventPayload::Session {
                session_id: "s1".into(),
                name: "brave-otter".into(),
            },
        );
    }
}
