//! `AuditEvent` — the append-only trail the event log writer persists (spec.md §3).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Priority;

/// The lifecycle events a message or response can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Enqueued,
    Dequeued,
    Processing,
    Completed,
    Failed,
    RetryScheduled,
    Promoted,
    Demoted,
    ConflictDetected,
    ConflictResolved,
    ConflictResolutionFailed,
    DeadLetter,
}

/// One row of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub message_id: Uuid,
    pub org_id: String,
    pub event_type: EventType,
    pub priority: Option<Priority>,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
    pub detail: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(message_id: Uuid, org_id: impl Into<String>, event_type: EventType) -> Self {
        AuditEvent {
            event_id: Uuid::new_v4(),
            message_id,
            org_id: org_id.into(),
            event_type,
            priority: None,
            occurred_at: chrono::Utc::now(),
            detail: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_stamps_a_fresh_event_id_and_timestamp() {
        let msg_id = Uuid::new_v4();
        let ev = AuditEvent::new(msg_id, "acme", EventType::Enqueued);
        assert_eq!(ev.message_id, msg_id);
        assert_eq!(ev.org_id, "acme");
        assert!(ev.priority.is_none());
    }

    #[test]
    fn builders_attach_priority_and_detail() {
        let ev = AuditEvent::new(Uuid::new_v4(), "acme", EventType::Demoted)
            .with_priority(Priority::P2)
            .with_detail(serde_json::json!({"from": "P1"}));
        assert_eq!(ev.priority, Some(Priority::P2));
        assert!(ev.detail.is_some());
    }
}
