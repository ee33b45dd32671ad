use crate::error::SseResult;
use crate::manager::EventManager;
use crate::models::{Event, Priority};
use std::collections::HashSet;
use std::sync::Arc;

/// Narrow outward-facing contract consumed by the web layer (and any future
/// non-HTTP caller). Handlers never see the queue/worker internals, only
/// this facade.
pub struct NotificationProvider {
    manager: Arc<EventManager>,
}

impl NotificationProvider {
    pub fn new(manager: Arc<EventManager>) -> Self {
        NotificationProvider { manager }
    }

    pub async fn send_user_notification(
        &self,
        event_type: &str,
        target_userid: i64,
        priority: Priority,
        expire_after_minutes: Option<i64>,
        payload: serde_json::Value,
    ) -> SseResult<Option<Event>> {
        self.manager
            .create_event(event_type, target_userid, priority, expire_after_minutes, payload)
            .await
    }

    /// Broadcast: iterate the online users for `event_type` and create one
    /// event per user. There is no "is_global" row — each recipient gets
    /// its own persisted event.
    pub async fn send_global_notification(
        &self,
        event_type: &str,
        priority: Priority,
        expire_after_minutes: Option<i64>,
        payload: serde_json::Value,
    ) -> SseResult<usize> {
        let recipients = self.manager.connections().get_eventtype_users(event_type);
        let mut sent = 0;
        for user_id in recipients {
            if self
                .manager
                .create_event(event_type, user_id, priority, expire_after_minutes, payload.clone())
                .await?
                .is_some()
            {
                sent += 1;
            }
        }
        Ok(sent)
    }

    pub async fn fetch_unread(&self, user_id: i64) -> SseResult<Vec<Event>> {
        self.manager.fetch_unread(user_id).await
    }

    pub async fn dismiss_items(&self, event_ids: &[i64], user_id: i64) -> SseResult<u64> {
        self.manager.bulk_mark_read(event_ids, user_id).await
    }

    /// Mark every currently unread event of `user_id` as read.
    pub async fn dismiss_all(&self, user_id: i64) -> SseResult<u64> {
        let unread = self.manager.fetch_unread(user_id).await?;
        let ids: Vec<i64> = unread.iter().filter_map(|e| e.id).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.manager.bulk_mark_read(&ids, user_id).await
    }

    pub async fn send_event(
        &self,
        event_type: &str,
        target_userid: i64,
        payload: serde_json::Value,
        priority: Priority,
    ) -> SseResult<bool> {
        self.manager
            .send_raw_event(event_type, target_userid, payload, priority)
            .await
    }

    pub fn get_connected_users(&self, event_type: &str) -> HashSet<i64> {
        self.manager.connections().get_eventtype_users(event_type)
    }

    pub fn manager(&self) -> &Arc<EventManager> {
        &self.manager
    }
}
