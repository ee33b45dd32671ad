use crate::error::SseError;
use crate::models::{Event, EventRow, Priority};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// One registered event class: a tag plus the behaviour needed to move
/// between store rows and in-memory events. The tag is data supplied at
/// registration time, never derived by reflecting over a type name.
#[derive(Clone)]
pub struct EventClass {
    pub tag: &'static str,
}

/// Sentinel distinguishing "row intentionally not consumed because the
/// event isn't deliverable" from an actual failure: `from_store_row` returns
/// the row iff deliverable, else this sentinel.
pub enum StoreConversion<T> {
    Row(T),
    Skip,
}

/// Process-wide registry mapping event-type tag -> registered class.
/// Write-once at startup, read-many at runtime: after `freeze()` is called
/// reads take no lock at all.
pub struct EventRegistry {
    building: RwLock<HashMap<String, EventClass>>,
    frozen: RwLock<Option<HashMap<String, EventClass>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        EventRegistry {
            building: RwLock::new(HashMap::new()),
            frozen: RwLock::new(None),
        }
    }

    /// Register an event type by tag. Idempotent — re-registering the same
    /// tag simply overwrites the entry.
    pub fn register(&self, tag: &'static str) {
        self.building
            .write()
            .unwrap()
            .insert(tag.to_string(), EventClass { tag });
    }

    /// Freeze the registry after startup registration completes. Further
    /// calls to `register` after this point still work but are not picked
    /// up by already-frozen snapshots — registration must complete before
    /// the first event of a type is created or recovered.
    pub fn freeze(&self) {
        let snapshot = self.building.read().unwrap().clone();
        *self.frozen.write().unwrap() = Some(snapshot);
    }

    fn contains(&self, tag: &str) -> bool {
        if let Some(frozen) = self.frozen.read().unwrap().as_ref() {
            return frozen.contains_key(tag);
        }
        self.building.read().unwrap().contains_key(tag)
    }

    /// `create_event` path: unregistered tag is a caller error.
    pub fn require(&self, tag: &str) -> Result<(), SseError> {
        if self.contains(tag) {
            Ok(())
        } else {
            Err(SseError::UnknownEventType(tag.to_string()))
        }
    }

    /// Recovery path: unregistered tag is a warning, row left in place.
    pub fn is_registered(&self, tag: &str) -> bool {
        self.contains(tag)
    }

    /// Build the row to persist. Persistence is unconditional: deliverability
    /// gates distribution only, not whether the row is written at all.
    pub fn to_store_row(&self, event: &Event) -> EventRowInsert {
        EventRowInsert {
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            target_userid: event.target_userid,
            priority: event.priority.as_str().to_string(),
            is_read: event.is_read,
            created_at: event.created_at,
            expired_at: event.expired_at,
        }
    }

    pub fn from_store_row(&self, row: EventRow) -> StoreConversion<Event> {
        let Some(priority) = Priority::from_str_name(&row.priority) else {
            return StoreConversion::Skip;
        };
        let event = Event {
            id: Some(row.id),
            event_type: row.event_type,
            payload: row.payload,
            target_userid: row.target_userid,
            priority,
            is_read: row.is_read,
            is_recovered: false,
            created_at: row.created_at,
            expired_at: row.expired_at,
        };
        if event.is_deliverable() {
            StoreConversion::Row(event)
        } else {
            StoreConversion::Skip
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fields needed to insert a new row; distinct from `EventRow` (the
/// read-side shape with an assigned `id`), the way an insert shape is kept
/// distinct from its read-side counterpart in a repository layer.
#[derive(Debug, Clone)]
pub struct EventRowInsert {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub target_userid: i64,
    pub priority: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_tag_fails_on_create() {
        let registry = EventRegistry::new();
        registry.freeze();
        assert!(matches!(
            registry.require("SystemNotification"),
            Err(SseError::UnknownEventType(_))
        ));
    }

    #[test]
    fn registered_tag_succeeds() {
        let registry = EventRegistry::new();
        registry.register("SystemNotification");
        registry.freeze();
        assert!(registry.require("SystemNotification").is_ok());
    }

    #[test]
    fn recovery_skip_is_silent_not_err() {
        let registry = EventRegistry::new();
        registry.freeze();
        assert!(!registry.is_registered("Nonexistent"));
    }
}
