//! Event record and the well-known event type names

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for events
pub type EventId = String;

pub const SESSION_CREATED: &str = "session_created";
pub const SESSION_IDLE: &str = "session_idle";
pub const SESSION_EXPIRED: &str = "session_expired";
pub const SESSION_CLOSED: &str = "session_closed";
pub const CONTEXT_UPDATED: &str = "context_updated";
pub const LISTENER_ERROR: &str = "listener_error";

pub const TASK_SUBMITTED: &str = "task_submitted";
pub const TURN_COMMITTED: &str = "turn_committed";
pub const TURN_INJECTED: &str = "turn_injected";
pub const TOOL_INVOKED: &str = "tool_invoked";
pub const TASK_PAUSED: &str = "task_paused";
pub const TASK_RESUMED: &str = "task_resumed";
pub const SPEAKER_OVERRIDDEN: &str = "speaker_overridden";
pub const SPEAKER_FORCED: &str = "speaker_forced";
pub const BREAKPOINTS_UPDATED: &str = "breakpoints_updated";
pub const TASK_COMPLETED: &str = "task_completed";
pub const TASK_FAILED: &str = "task_failed";
pub const TASK_CANCELLED: &str = "task_cancelled";
pub const TASK_ARCHIVED: &str = "task_archived";

/// A single published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Self::new_id(),
            session_id: None,
            task_id: None,
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Generate a unique event ID
    pub fn new_id() -> EventId {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_scopes() {
        let event = Event::new(TURN_COMMITTED, json!({"sequence": 3}))
            .for_session("s-1")
            .for_task("t-1");
        assert_eq!(event.session_id.as_deref(), Some("s-1"));
        assert_eq!(event.task_id.as_deref(), Some("t-1"));
        assert!(event.is(TURN_COMMITTED));
        assert_ne!(event.id, Event::new_id());
    }

    #[test]
    fn test_unscoped_fields_skipped_in_json() {
        let json = serde_json::to_value(Event::new(SESSION_CREATED, json!(null))).unwrap();
        assert!(json.get("session_id").is_none());
        assert_eq!(json["event_type"], "session_created");
    }
}
