use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Topic prefix for per-session events
pub const SESSION_TOPIC_PREFIX: &str = "debugger.session.";

pub fn session_topic(session_id: &str) -> String {
    format!("{}{}", SESSION_TOPIC_PREFIX, session_id)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Paused,
    Resumed,
    ConsoleApiCalled,
    SessionStarted,
    SessionEnded,
}

impl SessionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventKind::Paused => "paused",
            SessionEventKind::Resumed => "resumed",
            SessionEventKind::ConsoleApiCalled => "console_api_called",
            SessionEventKind::SessionStarted => "session_started",
            SessionEventKind::SessionEnded => "session_ended",
        }
    }
}

/// One event on a session topic
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub kind: SessionEventKind,
    #[serde(default)]
    pub data: Value,
}

impl SessionEvent {
    pub fn new(session_id: &str, kind: SessionEventKind, data: Value) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind,
            data,
        }
    }

    pub fn topic(&self) -> String {
        session_topic(&self.session_id)
    }

    /// Payload as published on the control channel
    pub fn payload(&self) -> Value {
        serde_json::json!({
            "session_id": self.session_id,
            "event": self.kind.as_str(),
            "data": self.data,
        })
    }
}

/// Broadcast of session events. Cloned into every bridge and the
/// orchestrator; the control channel publisher is the main subscriber.
#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Best effort: dropped when nobody listens
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}
