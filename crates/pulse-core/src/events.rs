//! Event model for the sync core.
//!
//! Defines the closed set of event types flowing through the bus, the typed
//! payload union, and the immutable [`Event`] record retained in the bounded
//! bus history. Event types use dot-namespaced wire names
//! (e.g. `"task.completed"`, `"sync.failed"`).
//!
//! Payloads are a closed `#[serde(tag = "type")]` union rather than free-form
//! JSON objects, so every consumer gets compile-time exhaustiveness checking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::health::SystemValidationResult;

// ============================================================================
// Event types
// ============================================================================

/// Closed enumeration of every event kind the bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Task lifecycle
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.updated")]
    TaskUpdated,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.deleted")]
    TaskDeleted,

    // Project lifecycle
    #[serde(rename = "project.created")]
    ProjectCreated,
    #[serde(rename = "project.updated")]
    ProjectUpdated,
    #[serde(rename = "project.deleted")]
    ProjectDeleted,
    #[serde(rename = "project.deadline_approaching")]
    DeadlineApproaching,
    #[serde(rename = "project.deadline_overdue")]
    DeadlineOverdue,

    // Resource lifecycle
    #[serde(rename = "resource.updated")]
    ResourceUpdated,
    #[serde(rename = "resource.removed")]
    ResourceRemoved,

    // Stakeholder lifecycle
    #[serde(rename = "stakeholder.updated")]
    StakeholderUpdated,
    #[serde(rename = "stakeholder.removed")]
    StakeholderRemoved,

    // Workspace / shared context
    #[serde(rename = "workspace.updated")]
    WorkspaceUpdated,
    #[serde(rename = "context.updated")]
    ContextUpdated,

    // Remote sync lifecycle
    #[serde(rename = "sync.started")]
    SyncStarted,
    #[serde(rename = "sync.completed")]
    SyncCompleted,
    #[serde(rename = "sync.failed")]
    SyncFailed,
    #[serde(rename = "sync.connection_lost")]
    ConnectionLost,
    #[serde(rename = "sync.connection_restored")]
    ConnectionRestored,

    // Self-monitoring
    #[serde(rename = "health.report")]
    HealthReport,
    #[serde(rename = "system.error")]
    SystemError,
}

impl EventType {
    /// The dot-namespaced wire name (e.g. `"task.completed"`).
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventType::TaskCreated => "task.created",
            EventType::TaskUpdated => "task.updated",
            EventType::TaskCompleted => "task.completed",
            EventType::TaskDeleted => "task.deleted",
            EventType::ProjectCreated => "project.created",
            EventType::ProjectUpdated => "project.updated",
            EventType::ProjectDeleted => "project.deleted",
            EventType::DeadlineApproaching => "project.deadline_approaching",
            EventType::DeadlineOverdue => "project.deadline_overdue",
            EventType::ResourceUpdated => "resource.updated",
            EventType::ResourceRemoved => "resource.removed",
            EventType::StakeholderUpdated => "stakeholder.updated",
            EventType::StakeholderRemoved => "stakeholder.removed",
            EventType::WorkspaceUpdated => "workspace.updated",
            EventType::ContextUpdated => "context.updated",
            EventType::SyncStarted => "sync.started",
            EventType::SyncCompleted => "sync.completed",
            EventType::SyncFailed => "sync.failed",
            EventType::ConnectionLost => "sync.connection_lost",
            EventType::ConnectionRestored => "sync.connection_restored",
            EventType::HealthReport => "health.report",
            EventType::SystemError => "system.error",
        }
    }

    /// Per-entity update event for records fetched in a named collection.
    pub fn update_for_collection(collection: &str) -> EventType {
        match collection {
            "projects" => EventType::ProjectUpdated,
            "tasks" => EventType::TaskUpdated,
            "resources" => EventType::ResourceUpdated,
            "stakeholders" => EventType::StakeholderUpdated,
            _ => EventType::WorkspaceUpdated,
        }
    }

    /// Per-entity removal event for ids that disappeared from a collection.
    pub fn removal_for_collection(collection: &str) -> EventType {
        match collection {
            "projects" => EventType::ProjectDeleted,
            "tasks" => EventType::TaskDeleted,
            "resources" => EventType::ResourceRemoved,
            "stakeholders" => EventType::StakeholderRemoved,
            _ => EventType::WorkspaceUpdated,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

// ============================================================================
// Change records
// ============================================================================

/// Before/after transition of a stored collection value.
///
/// Emitted whenever a stored record is written, whether by a local write or
/// by a detected sibling-process write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Logical collection name (e.g. `"projects"`).
    pub key: String,
    /// Value before the write. `None` for the first write of a key.
    pub old_value: Option<JsonValue>,
    /// Value after the write. `None` when the key was deleted.
    pub new_value: Option<JsonValue>,
    /// When the change was observed (UTC).
    pub timestamp: DateTime<Utc>,
    /// Who wrote: a component name or `"external_sync"`.
    pub source: String,
}

// ============================================================================
// Payloads
// ============================================================================

/// Closed payload union, one variant per event kind.
///
/// Serialized with a `type` tag field, e.g.
/// `{"type":"Entity","collection":"tasks","id":"t1","record":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// No payload. Callers emitting without a payload are normalized to this.
    Empty,
    /// Full snapshot of one entity record within a collection.
    Entity {
        collection: String,
        id: String,
        record: JsonValue,
    },
    /// An entity disappeared from the remote source.
    EntityRemoved { collection: String, id: String },
    /// A stored collection changed (local or sibling-process write).
    ContextChange { change: ChangeEvent },
    /// A deadline-bearing record is approaching or past its deadline.
    Deadline {
        collection: String,
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        deadline: DateTime<Utc>,
        days_remaining: i64,
    },
    /// Summary of one completed sync pass.
    SyncRun {
        collections: usize,
        records: usize,
        duration_ms: u64,
    },
    /// A sync pass failed.
    SyncFailure { message: String },
    /// Connectivity transitioned.
    Connectivity { online: bool },
    /// Full health validation result.
    Health { result: SystemValidationResult },
    /// Internal component failure, re-published for observers.
    SystemFailure {
        component: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        failing_event: Option<String>,
    },
}

// ============================================================================
// Events
// ============================================================================

/// Immutable event record.
///
/// Constructed once at emission and never mutated afterwards; the bus retains
/// the most recent [`crate::defaults::EVENT_HISTORY_CAPACITY`] of them,
/// newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier (UUIDv7 for temporal ordering).
    pub id: Uuid,
    /// Event kind.
    pub event_type: EventType,
    /// Typed payload.
    pub payload: EventPayload,
    /// When the event was emitted (UTC).
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event.
    pub source: String,
}

impl Event {
    /// Construct a new event stamped with a fresh UUIDv7 and the current time.
    pub fn new(event_type: EventType, payload: EventPayload, source: impl Into<String>) -> Self {
        Self {
            id: crate::uuid_utils::new_v7(),
            event_type,
            payload,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_match_serde_renames() {
        for ty in [
            EventType::TaskCompleted,
            EventType::ProjectUpdated,
            EventType::ContextUpdated,
            EventType::SyncFailed,
            EventType::HealthReport,
            EventType::SystemError,
        ] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.wire_name()));
        }
    }

    #[test]
    fn test_display_uses_wire_name() {
        assert_eq!(EventType::TaskCompleted.to_string(), "task.completed");
        assert_eq!(
            EventType::ConnectionRestored.to_string(),
            "sync.connection_restored"
        );
    }

    #[test]
    fn test_update_event_for_known_collections() {
        assert_eq!(
            EventType::update_for_collection("projects"),
            EventType::ProjectUpdated
        );
        assert_eq!(
            EventType::update_for_collection("tasks"),
            EventType::TaskUpdated
        );
        assert_eq!(
            EventType::update_for_collection("resources"),
            EventType::ResourceUpdated
        );
        assert_eq!(
            EventType::update_for_collection("stakeholders"),
            EventType::StakeholderUpdated
        );
    }

    #[test]
    fn test_update_event_falls_back_to_workspace() {
        assert_eq!(
            EventType::update_for_collection("milestones"),
            EventType::WorkspaceUpdated
        );
    }

    #[test]
    fn test_removal_event_for_known_collections() {
        assert_eq!(
            EventType::removal_for_collection("projects"),
            EventType::ProjectDeleted
        );
        assert_eq!(
            EventType::removal_for_collection("resources"),
            EventType::ResourceRemoved
        );
    }

    #[test]
    fn test_payload_json_tagging() {
        let payload = EventPayload::Entity {
            collection: "tasks".to_string(),
            id: "t1".to_string(),
            record: serde_json::json!({"id": "t1", "status": "done"}),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""type":"Entity"#));
        assert!(json.contains(r#""collection":"tasks"#));

        let back: EventPayload = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, EventPayload::Entity { .. }));
    }

    #[test]
    fn test_payload_deadline_skips_none_name() {
        let payload = EventPayload::Deadline {
            collection: "projects".to_string(),
            id: "p1".to_string(),
            name: None,
            deadline: Utc::now(),
            days_remaining: 3,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("name"));
        assert!(json.contains(r#""days_remaining":3"#));
    }

    #[test]
    fn test_event_new_stamps_v7_id() {
        let event = Event::new(EventType::TaskCreated, EventPayload::Empty, "test");
        assert!(crate::uuid_utils::is_v7(&event.id));
        assert_eq!(event.source, "test");
        assert_eq!(event.event_type, EventType::TaskCreated);
    }

    #[test]
    fn test_change_event_roundtrip() {
        let change = ChangeEvent {
            key: "projects".to_string(),
            old_value: None,
            new_value: Some(serde_json::json!([{"id": "p1"}])),
            timestamp: Utc::now(),
            source: "remote_sync".to_string(),
        };
        let json = serde_json::to_string(&change).unwrap();
        let back: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, "projects");
        assert!(back.old_value.is_none());
        assert_eq!(back.source, "remote_sync");
    }
}
