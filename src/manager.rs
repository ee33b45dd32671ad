use crate::config::Config;
use crate::connection::{ConnectionManager, Mailbox};
use crate::error::{SseError, SseResult};
use crate::models::{Event, Priority};
use crate::registry::{EventRegistry, StoreConversion};
use crate::store::Store;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Owns the central bounded event queue and the two background workers
/// (distributor, cleanup). Entry point for every creation, delivery, and
/// recovery operation.
pub struct EventManager {
    registry: Arc<EventRegistry>,
    store: Arc<dyn Store>,
    connections: Arc<ConnectionManager>,
    config: Config,

    queue_tx: mpsc::Sender<Event>,
    queue_rx: AsyncMutex<mpsc::Receiver<Event>>,

    state: Mutex<ManagerState>,
    shutting_down: AtomicBool,

    distributor_handle: Mutex<Option<JoinHandle<()>>>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventManager {
    /// Construct the manager and run startup recovery (`purge_stale` once).
    /// Does not spawn background workers
    /// — call `spawn_workers` for production use, or single-step via
    /// `distribute_one`/`run_cleanup_once` in tests.
    pub async fn new(
        config: Config,
        store: Arc<dyn Store>,
        registry: Arc<EventRegistry>,
    ) -> Arc<Self> {
        if let Err(e) = store.purge_stale().await {
            tracing::error!(error = %e, "startup purge_stale failed");
        }

        let (tx, rx) = mpsc::channel(config.max_event_queue_size);
        let connections = Arc::new(ConnectionManager::new(
            config.max_connections_per_user,
            config.max_events_per_stream,
        ));

        Arc::new(EventManager {
            registry,
            store,
            connections,
            config,
            queue_tx: tx,
            queue_rx: AsyncMutex::new(rx),
            state: Mutex::new(ManagerState::Running),
            shutting_down: AtomicBool::new(false),
            distributor_handle: Mutex::new(None),
            cleanup_handle: Mutex::new(None),
        })
    }

    /// Spawn the distributor and cleanup background tasks. Production
    /// entry point; tests instead drive `distribute_one`/`run_cleanup_once`
    /// directly for deterministic, single-stepped behaviour.
    pub fn spawn_workers(self: &Arc<Self>) {
        let distributor = tokio::spawn(Self::distributor_loop(self.clone()));
        let cleanup = tokio::spawn(Self::cleanup_loop(self.clone()));
        *self.distributor_handle.lock().unwrap() = Some(distributor);
        *self.cleanup_handle.lock().unwrap() = Some(cleanup);
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap()
    }

    fn ensure_running(&self) -> SseResult<()> {
        if self.state() == ManagerState::Running {
            Ok(())
        } else {
            Err(SseError::ManagerNotRunning)
        }
    }

    /// Creation path.
    pub async fn create_event(
        &self,
        event_type: &str,
        target_userid: i64,
        priority: Priority,
        expire_after_minutes: Option<i64>,
        payload: serde_json::Value,
    ) -> SseResult<Option<Event>> {
        self.ensure_running()?;
        self.registry.require(event_type)?;

        let expired_at = expire_after_minutes.map(|m| Utc::now() + ChronoDuration::minutes(m));
        let mut event = Event::new(event_type, payload, target_userid, priority, expired_at);

        let insert_row = self.registry.to_store_row(&event);
        let id = self.store.insert(insert_row).await?;
        event.id = Some(id);

        if self.connections.is_online(target_userid) {
            match self.queue_tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::error!(
                        target_userid,
                        event_id = id,
                        "central event queue full; dropping distribution, row persists for recovery"
                    );
                    return Ok(None);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::error!("central event queue closed");
                    return Ok(None);
                }
            }
        }

        Ok(Some(event))
    }

    /// Ephemeral path: same wire shape, never persisted.
    pub async fn send_raw_event(
        &self,
        event_type: &str,
        target_userid: i64,
        payload: serde_json::Value,
        priority: Priority,
    ) -> SseResult<bool> {
        self.ensure_running()?;

        if !self.connections.is_online(target_userid) {
            return Ok(false);
        }

        let event = Event::new(event_type, payload, target_userid, priority, None);
        match self.queue_tx.try_send(event) {
            Ok(()) => Ok(true),
            Err(_) => {
                tracing::warn!(target_userid, "central queue full; dropping raw event");
                Ok(false)
            }
        }
    }

    /// Unread events for a user, newest-store-order, converted to in-memory
    /// events via the registry (rows whose priority can't be parsed are
    /// silently skipped rather than failing the whole fetch).
    pub async fn fetch_unread(&self, user_id: i64) -> SseResult<Vec<Event>> {
        let rows = self.store.fetch_unread(user_id).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match self.registry.from_store_row(row) {
                StoreConversion::Row(event) => Some(event),
                StoreConversion::Skip => None,
            })
            .collect())
    }

    pub async fn mark_read(&self, event_id: i64, user_id: i64) -> SseResult<crate::store::MarkReadOutcome> {
        Ok(self.store.mark_read(event_id, user_id).await?)
    }

    pub async fn bulk_mark_read(&self, event_ids: &[i64], user_id: i64) -> SseResult<u64> {
        Ok(self.store.bulk_mark_read(event_ids, user_id).await?)
    }

    /// Stream registration. Always admits today (the
    /// ConnectionManager evicts rather than refuses), so this never
    /// returns `Ok(None)` in practice — the `Option` is kept to match the
    /// documented "reserved for future" refusal path.
    pub async fn register_user_stream(
        self: &Arc<Self>,
        user_id: i64,
        event_type: &str,
    ) -> SseResult<Option<(Uuid, Arc<Mailbox>)>> {
        self.ensure_running()?;
        let (stream_id, mailbox) = self.connections.add_connection(user_id, event_type);
        self.recover(user_id, event_type).await;
        Ok(Some((stream_id, mailbox)))
    }

    /// Stream deregistration. Always allowed, even during shutdown — this
    /// is the cleanup path a dying HTTP connection must be able to call.
    pub fn unregister_user_stream(&self, user_id: i64, stream_id: Uuid) {
        self.connections.remove_connection(user_id, stream_id);
    }

    /// Mailbox write policy: push the event into every
    /// currently open mailbox of its target user, applying drop-oldest
    /// overflow inside `Mailbox::push`.
    async fn distribute(&self, event: Event) {
        let mailboxes = self.connections.get_user_streams(event.target_userid);
        for mailbox in mailboxes {
            mailbox.push(event.clone()).await;
        }
    }

    async fn process_event(&self, event: Event) {
        if event.is_read || event.is_expired() {
            return;
        }
        self.distribute(event).await;
    }

    /// Pop one event from the central queue (with the configured poll
    /// timeout) and distribute it. Returns `true` if an event was
    /// processed, `false` on timeout. Exposed publicly so tests can
    /// single-step the distributor deterministically.
    pub async fn distribute_one(&self) -> bool {
        let mut rx = self.queue_rx.lock().await;
        match tokio::time::timeout(self.config.distributor_poll_timeout, rx.recv()).await {
            Ok(Some(event)) => {
                drop(rx);
                self.process_event(event).await;
                true
            }
            _ => false,
        }
    }

    async fn distributor_loop(self: Arc<Self>) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.distribute_one().await;
        }
    }

    /// One cleanup tick. Exposed for
    /// tests to drive deterministically instead of waiting on the real
    /// interval.
    pub async fn run_cleanup_once(&self) {
        match self.store.purge_stale().await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!(count, "cleanup purged stale rows");
                }
            }
            Err(e) => tracing::error!(error = %e, "cleanup purge_stale failed"),
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + self.config.cleanup_interval, self.config.cleanup_interval);
        loop {
            interval.tick().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.run_cleanup_once().await;
        }
    }

    /// Recovery on reconnect. Fetches unread rows for
    /// `(user_id, event_type)`, drops expired ones, warns-and-skips
    /// unregistered types, and materialises the rest with
    /// `is_recovered = true` into every currently open mailbox of that
    /// user. Expired rows are collected and deleted as a single batch, not
    /// one commit per row.
    async fn recover(&self, user_id: i64, event_type: &str) {
        let rows = match self.store.fetch_unread_by_type(user_id, event_type).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, user_id, event_type, "recovery fetch_unread_by_type failed");
                return;
            }
        };

        let mut expired_ids = Vec::new();

        for row in rows {
            let expired = row
                .expired_at
                .map(|e| e <= Utc::now())
                .unwrap_or(false);
            if expired {
                expired_ids.push(row.id);
                continue;
            }

            if !self.registry.is_registered(&row.event_type) {
                tracing::warn!(event_type = %row.event_type, event_id = row.id, "recovery: unregistered event type, leaving row for cleanup worker");
                continue;
            }

            let mut event = match self.registry.from_store_row(row) {
                StoreConversion::Row(event) => event,
                StoreConversion::Skip => continue,
            };
            event.is_recovered = true;
            self.distribute(event).await;
        }

        if !expired_ids.is_empty() {
            if let Err(e) = self.store.delete_batch(&expired_ids).await {
                tracing::error!(error = %e, count = expired_ids.len(), "failed to delete expired rows during recovery");
            }
        }
    }

    /// Idempotent shutdown. Concurrent calls after the
    /// first are no-ops.
    pub async fn shutdown(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, ManagerState::ShuttingDown | ManagerState::Stopped) {
                return;
            }
            *state = ManagerState::ShuttingDown;
        }
        self.shutting_down.store(true, Ordering::SeqCst);

        // Step 2: drain the central queue. Every event already carries an
        // id (create_event always persists first), so there is nothing
        // left to store here — just stop holding onto them.
        {
            let mut rx = self.queue_rx.lock().await;
            let mut drained = 0u32;
            while rx.try_recv().is_ok() {
                drained += 1;
            }
            tracing::info!(drained, "drained central queue on shutdown");
        }

        // Step 3: disconnect every connected user.
        for user_id in self.connections.online_user_ids() {
            self.connections.remove_all_connections(user_id);
        }

        // Step 4: join distributor, bounded wait.
        if let Some(handle) = self.distributor_handle.lock().unwrap().take() {
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                tracing::warn!("distributor worker did not exit within 10s; process exit will finish it");
            }
        }

        // Step 5: final purge_stale.
        if let Err(e) = self.store.purge_stale().await {
            tracing::error!(error = %e, "final purge_stale failed during shutdown");
        }

        // Step 6: join cleanup, bounded wait.
        if let Some(handle) = self.cleanup_handle.lock().unwrap().take() {
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                tracing::warn!("cleanup worker did not exit within 10s; process exit will finish it");
            }
        }

        *self.state.lock().unwrap() = ManagerState::Stopped;
        tracing::info!("event manager shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::store::memory::MemoryEventStore;

    fn test_registry() -> Arc<EventRegistry> {
        let registry = EventRegistry::new();
        events::register_builtin_types(&registry);
        registry.freeze();
        Arc::new(registry)
    }

    async fn test_manager(config: Config) -> Arc<EventManager> {
        EventManager::new(config, Arc::new(MemoryEventStore::new()), test_registry()).await
    }

    async fn test_manager_with_store(config: Config, store: Arc<MemoryEventStore>) -> Arc<EventManager> {
        EventManager::new(config, store, test_registry()).await
    }

    #[tokio::test]
    async fn online_user_gets_event_after_single_step_distribute() {
        let manager = test_manager(Config::default()).await;
        let (stream_id, mailbox) = manager
            .register_user_stream(42, events::SYSTEM_NOTIFICATION)
            .await
            .unwrap()
            .unwrap();

        let created = manager
            .create_event(
                events::SYSTEM_NOTIFICATION,
                42,
                Priority::Normal,
                Some(60),
                serde_json::json!({"title": "hi", "message": "there"}),
            )
            .await
            .unwrap();
        assert!(created.is_some());

        assert!(manager.distribute_one().await);

        let got = mailbox.try_pop().await.expect("event delivered");
        assert_eq!(got.event_type, events::SYSTEM_NOTIFICATION);
        assert!(!got.is_recovered);
        let wire = got.to_wire();
        assert_eq!(wire.priority, "NORMAL");
        assert_eq!(wire.payload["title"], "hi");

        manager.unregister_user_stream(42, stream_id);
    }

    #[tokio::test]
    async fn offline_user_not_enqueued_row_persists() {
        let manager = test_manager(Config::default()).await;

        let created = manager
            .create_event(
                events::SYSTEM_NOTIFICATION,
                7,
                Priority::Normal,
                None,
                serde_json::json!({"title": "a", "message": "b"}),
            )
            .await
            .unwrap();
        assert!(created.is_some());

        // Nothing in the queue to distribute — user was never online.
        assert!(!manager.distribute_one().await);
    }

    #[tokio::test]
    async fn offline_then_recover_delivers_in_priority_created_order() {
        let manager = test_manager(Config::default()).await;

        for (title, prio) in [("a", Priority::Low), ("b", Priority::High), ("c", Priority::Normal)] {
            manager
                .create_event(
                    events::SYSTEM_NOTIFICATION,
                    42,
                    prio,
                    None,
                    serde_json::json!({"title": title, "message": "x"}),
                )
                .await
                .unwrap();
        }

        let (_sid, mailbox) = manager
            .register_user_stream(42, events::SYSTEM_NOTIFICATION)
            .await
            .unwrap()
            .unwrap();

        let contents = mailbox.snapshot().await;
        assert_eq!(contents.len(), 3);
        let titles: Vec<&str> = contents
            .iter()
            .map(|e| e.payload["title"].as_str().unwrap())
            .collect();
        // priority desc (High, Normal, Low) then created asc within ties
        assert_eq!(titles, vec!["b", "c", "a"]);
        assert!(contents.iter().all(|e| e.is_recovered));
    }

    #[tokio::test]
    async fn create_event_persists_even_when_immediately_expired() {
        let store = Arc::new(MemoryEventStore::new());
        let manager = test_manager_with_store(Config::default(), store.clone()).await;

        let created = manager
            .create_event(
                events::SYSTEM_NOTIFICATION,
                1,
                Priority::Normal,
                Some(-5),
                serde_json::json!({"title": "already gone", "message": "x"}),
            )
            .await
            .unwrap();

        assert!(created.is_some());
        assert_eq!(store.row_count(), 1);
        assert!(!manager.distribute_one().await);
    }

    #[tokio::test]
    async fn recover_deletes_expired_rows_as_one_batch() {
        let store = Arc::new(MemoryEventStore::new());
        let manager = test_manager_with_store(Config::default(), store.clone()).await;

        let past = Utc::now() - ChronoDuration::minutes(1);
        for i in 0..3 {
            store
                .insert(crate::registry::EventRowInsert {
                    event_type: events::SYSTEM_NOTIFICATION.to_string(),
                    payload: serde_json::json!({"title": format!("expired{i}"), "message": "x"}),
                    target_userid: 5,
                    priority: "NORMAL".to_string(),
                    is_read: false,
                    created_at: Utc::now(),
                    expired_at: Some(past),
                })
                .await
                .unwrap();
        }

        manager
            .create_event(
                events::SYSTEM_NOTIFICATION,
                5,
                Priority::Normal,
                None,
                serde_json::json!({"title": "still good", "message": "x"}),
            )
            .await
            .unwrap();
        assert_eq!(store.row_count(), 4);

        let (_sid, mailbox) = manager
            .register_user_stream(5, events::SYSTEM_NOTIFICATION)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.row_count(), 1);
        let contents = mailbox.snapshot().await;
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].payload["title"], "still good");
    }

    #[tokio::test]
    async fn queue_full_third_create_returns_none_rows_all_exist() {
        let mut config = Config::default();
        config.max_event_queue_size = 2;
        let manager = test_manager(config).await;

        manager
            .register_user_stream(9, events::SYSTEM_NOTIFICATION)
            .await
            .unwrap();

        let mut results = vec![];
        for i in 0..3 {
            let r = manager
                .create_event(
                    events::SYSTEM_NOTIFICATION,
                    9,
                    Priority::Normal,
                    None,
                    serde_json::json!({"title": format!("t{i}"), "message": "m"}),
                )
                .await
                .unwrap();
            results.push(r);
        }

        assert!(results[0].is_some());
        assert!(results[1].is_some());
        assert!(results[2].is_none());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_blocks_further_creates() {
        let manager = test_manager(Config::default()).await;
        manager.shutdown().await;
        manager.shutdown().await; // second call: no-op, no panic

        assert_eq!(manager.state(), ManagerState::Stopped);

        let result = manager
            .create_event(
                events::SYSTEM_NOTIFICATION,
                1,
                Priority::Normal,
                None,
                serde_json::json!({"title": "x", "message": "y"}),
            )
            .await;
        assert!(matches!(result, Err(SseError::ManagerNotRunning)));
    }

    #[tokio::test]
    async fn shutdown_preserves_unsent_events_in_store() {
        let store = Arc::new(MemoryEventStore::new());
        let manager = test_manager_with_store(Config::default(), store.clone()).await;
        manager
            .register_user_stream(3, events::SYSTEM_NOTIFICATION)
            .await
            .unwrap();

        for i in 0..5 {
            manager
                .create_event(
                    events::SYSTEM_NOTIFICATION,
                    3,
                    Priority::Normal,
                    None,
                    serde_json::json!({"title": format!("t{i}"), "message": "m"}),
                )
                .await
                .unwrap();
        }

        // distributor never single-stepped — events sit in the queue.
        manager.shutdown().await;

        assert_eq!(store.row_count(), 5);
        assert!(store.all_rows().iter().all(|r| !r.is_read));
    }

    #[tokio::test]
    async fn unregistered_event_type_fails_create() {
        let manager = test_manager(Config::default()).await;
        let result = manager
            .create_event("NotRegistered", 1, Priority::Normal, None, serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(SseError::UnknownEventType(_))));
    }
}
