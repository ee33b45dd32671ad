use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Event priority. Ordering is used only for recovery sort (priority desc,
/// created_at asc) — it is never a runtime queue discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Some(Priority::Low),
            "NORMAL" => Some(Priority::Normal),
            "HIGH" => Some(Priority::High),
            "CRITICAL" => Some(Priority::Critical),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// The in-memory event record.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Option<i64>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub target_userid: i64,
    pub priority: Priority,
    pub is_read: bool,
    pub is_recovered: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        target_userid: i64,
        priority: Priority,
        expired_at: Option<DateTime<Utc>>,
    ) -> Self {
        Event {
            id: None,
            event_type: event_type.into(),
            payload,
            target_userid,
            priority,
            is_read: false,
            is_recovered: false,
            created_at: Utc::now(),
            expired_at,
        }
    }

    /// Invariant 1: deliverable iff not read and not expired.
    pub fn is_expired(&self) -> bool {
        match self.expired_at {
            Some(t) => t <= Utc::now(),
            None => false,
        }
    }

    pub fn is_deliverable(&self) -> bool {
        !self.is_read && !self.is_expired()
    }

    pub fn to_wire(&self) -> WireEvent {
        WireEvent {
            id: self.id.unwrap_or_default(),
            event_type: self.event_type.clone(),
            priority: self.priority.as_str(),
            created_at: self.created_at.to_rfc3339(),
            payload: self.payload.clone(),
            is_recovered: self.is_recovered,
        }
    }
}

/// Equality/hashing by `id` once persisted; two unpersisted events are
/// never equal to each other (identity semantics).
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}
impl Eq for Event {}

impl std::hash::Hash for Event {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Exact `to_wire_dict()` shape sent over SSE.
#[derive(Debug, Clone, Serialize)]
pub struct WireEvent {
    pub id: i64,
    pub event_type: String,
    pub priority: &'static str,
    pub created_at: String,
    pub payload: serde_json::Value,
    pub is_recovered: bool,
}

/// Row shape as persisted in the `event` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub id: i64,
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
    use chrono::Duration;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn unpersisted_events_never_equal() {
        let a = Event::new("X", serde_json::json!({}), 1, Priority::Normal, None);
        let b = Event::new("X", serde_json::json!({}), 1, Priority::Normal, None);
        assert_ne!(a, b);
    }

    #[test]
    fn persisted_events_equal_by_id() {
        let mut a = Event::new("X", serde_json::json!({}), 1, Priority::Normal, None);
        let mut b = Event::new("X", serde_json::json!({}), 1, Priority::Normal, None);
        a.id = Some(5);
        b.id = Some(5);
        assert_eq!(a, b);
    }

    #[test]
    fn expiry_invariant() {
        let past = Utc::now() - Duration::minutes(1);
        let e = Event::new("X", serde_json::json!({}), 1, Priority::Normal, Some(past));
        assert!(e.is_expired());
        assert!(!e.is_deliverable());

        let future = Utc::now() + Duration::minutes(60);
        let e2 = Event::new("X", serde_json::json!({}), 1, Priority::Normal, Some(future));
        assert!(!e2.is_expired());
        assert!(e2.is_deliverable());
    }
}
