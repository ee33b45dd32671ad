//! Concrete registered event types shipped with this crate: a
//! `SystemNotification` plus a couple more payload-typed event classes.
//! Each is a plain serde struct registered under a tag; adding one never
//! changes the registry's or manager's contract.

use serde::{Deserialize, Serialize};

pub const SYSTEM_NOTIFICATION: &str = "SystemNotification";
pub const TASK_ASSIGNED: &str = "TaskAssigned";
pub const RECORD_UPDATED: &str = "RecordUpdated";

/// Payload for the `SystemNotification` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemNotificationPayload {
    pub title: String,
    pub message: String,
}

/// Payload for `TaskAssigned` — a record assignment notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignedPayload {
    pub task_id: String,
    pub task_title: String,
    pub assigned_by: String,
}

/// Payload for `RecordUpdated` — a generic change notification for any
/// resource a user is watching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordUpdatedPayload {
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
}

/// Register the event types this crate ships with. Call once at startup
/// before the registry is frozen.
pub fn register_builtin_types(registry: &crate::registry::EventRegistry) {
    registry.register(SYSTEM_NOTIFICATION);
    registry.register(TASK_ASSIGNED);
    registry.register(RECORD_UPDATED);
}
