use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::Session;

/// Lifecycle events pushed to connected clients. Each `session:*` event
/// carries the full session projection; `timer:update` is the lightweight
/// periodic refresh shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum SessionEvent {
    #[serde(rename = "session:started")]
    Started { session: Session },
    #[serde(rename = "session:paused")]
    Paused { session: Session },
    #[serde(rename = "session:resumed")]
    Resumed { session: Session },
    #[serde(rename = "session:stopped")]
    Stopped { session: Session },
    #[serde(rename = "timer:update")]
    #[serde(rename_all = "camelCase")]
    TimerUpdate {
        session_id: String,
        elapsed_seconds: u64,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Started { .. } => "session:started",
            SessionEvent::Paused { .. } => "session:paused",
            SessionEvent::Resumed { .. } => "session:resumed",
            SessionEvent::Stopped { .. } => "session:stopped",
            SessionEvent::TimerUpdate { .. } => "timer:update",
        }
    }
}

/// Wire frame for the cross-instance bridge. `origin` is the publishing
/// instance id so an instance can drop its own echo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub origin: String,
    pub user_id: String,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Event-emission seam between the lifecycle manager and whatever delivers
/// notifications. The manager only ever sees this trait; the fanout gateway
/// is one implementation.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Best-effort delivery to every live connection of `user_id`.
    /// Failures are logged by the implementation, never surfaced to the
    /// lifecycle operation that triggered the event.
    async fn publish(&self, user_id: &str, event: SessionEvent);
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn events_serialize_with_spec_names() {
        let session = Session::new_open("u1", "p1", Utc::now());
        let value =
            serde_json::to_value(SessionEvent::Started { session }).expect("serializes");
        assert_eq!(value["event"], "session:started");
        assert_eq!(value["payload"]["session"]["userId"], "u1");

        let tick = serde_json::to_value(SessionEvent::TimerUpdate {
            session_id: "s1".into(),
            elapsed_seconds: 95,
        })
        .expect("serializes");
        assert_eq!(tick["event"], "timer:update");
        assert_eq!(tick["payload"]["sessionId"], "s1");
        assert_eq!(tick["payload"]["elapsedSeconds"], 95);
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = EventEnvelope {
            origin: "instance-a".into(),
            user_id: "u1".into(),
            event: SessionEvent::TimerUpdate {
                session_id: "s1".into(),
                elapsed_seconds: 10,
            },
        };

        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
