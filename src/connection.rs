use crate::models::Event;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use uuid::Uuid;

/// A bounded FIFO feeding one SSE HTTP response.
/// Exclusively owned by the `ConnectionManager`; the web handler only
/// borrows a reference for the lifetime of one HTTP stream.
pub struct Mailbox {
    pub stream_id: Uuid,
    capacity: usize,
    queue: AsyncMutex<VecDeque<Event>>,
    notify: Notify,
}

impl Mailbox {
    pub fn new(stream_id: Uuid, capacity: usize) -> Self {
        Mailbox {
            stream_id,
            capacity,
            queue: AsyncMutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
        }
    }

    /// Non-blocking put; drop-oldest-then-put on overflow — the
    /// "lossy-newest-wins" rule.
    pub async fn push(&self, event: Event) {
        let mut q = self.queue.lock().await;
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(event);
        drop(q);
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Snapshot contents oldest-to-newest, for testing overflow behaviour.
    pub async fn snapshot(&self) -> Vec<Event> {
        self.queue.lock().await.iter().cloned().collect()
    }

    /// Pop one event if immediately available, else `None`.
    pub async fn try_pop(&self) -> Option<Event> {
        self.queue.lock().await.pop_front()
    }

    /// Blocking-with-timeout pop, used by the SSE handler: a
    /// timeout means "emit a heartbeat frame", not an error.
    pub async fn pop_wait(&self, timeout: std::time::Duration) -> Option<Event> {
        if let Some(e) = self.try_pop().await {
            return Some(e);
        }
        let notified = self.notify.notified();
        tokio::select! {
            _ = tokio::time::sleep(timeout) => None,
            _ = notified => self.try_pop().await,
        }
    }
}

struct ConnectionTableInner {
    /// user_id -> (stream_id -> mailbox)
    user_streams: HashMap<i64, HashMap<Uuid, Arc<Mailbox>>>,
    /// stream_id -> (user_id, event_type), used to enumerate/clean up
    /// opaque stream ids without ever inferring structure from them.
    stream_owner: HashMap<Uuid, (i64, String)>,
    /// stream_id -> admission time, for oldest-first eviction.
    connect_time: HashMap<Uuid, Instant>,
    /// event_type -> set of online user ids.
    eventtype_users: HashMap<String, HashSet<i64>>,
}

/// Tracks live per-user SSE mailboxes. All state lives behind one mutex:
/// every read/write happens under lock, and callers get snapshot copies to
/// iterate lock-free.
pub struct ConnectionManager {
    inner: std::sync::Mutex<ConnectionTableInner>,
    max_connections_per_user: usize,
    max_events_per_stream: usize,
}

impl ConnectionManager {
    pub fn new(max_connections_per_user: usize, max_events_per_stream: usize) -> Self {
        ConnectionManager {
            inner: std::sync::Mutex::new(ConnectionTableInner {
                user_streams: HashMap::new(),
                stream_owner: HashMap::new(),
                connect_time: HashMap::new(),
                eventtype_users: HashMap::new(),
            }),
            max_connections_per_user,
            max_events_per_stream,
        }
    }

    pub fn max_events_per_stream(&self) -> usize {
        self.max_events_per_stream
    }

    /// Admit a new mailbox for `user_id`/`event_type`. If the user already
    /// holds `max_connections_per_user` mailboxes, evicts the strictly
    /// oldest one first.
    pub fn add_connection(&self, user_id: i64, event_type: &str) -> (Uuid, Arc<Mailbox>) {
        let mut guard = self.inner.lock().unwrap();

        if let Some(streams) = guard.user_streams.get(&user_id) {
            if streams.len() >= self.max_connections_per_user {
                let oldest = streams
                    .keys()
                    .min_by_key(|sid| guard.connect_time.get(*sid).copied().unwrap_or_else(Instant::now))
                    .copied();
                if let Some(oldest_id) = oldest {
                    Self::remove_locked(&mut guard, user_id, oldest_id);
                }
            }
        }

        let stream_id = Uuid::new_v4();
        let mailbox = Arc::new(Mailbox::new(stream_id, self.max_events_per_stream));

        guard
            .user_streams
            .entry(user_id)
            .or_default()
            .insert(stream_id, mailbox.clone());
        guard
            .stream_owner
            .insert(stream_id, (user_id, event_type.to_string()));
        guard.connect_time.insert(stream_id, Instant::now());
        guard
            .eventtype_users
            .entry(event_type.to_string())
            .or_default()
            .insert(user_id);

        (stream_id, mailbox)
    }

    /// Idempotent: removing a stream that is already gone is a no-op.
    pub fn remove_connection(&self, user_id: i64, stream_id: Uuid) {
        let mut guard = self.inner.lock().unwrap();
        Self::remove_locked(&mut guard, user_id, stream_id);
    }

    fn remove_locked(guard: &mut ConnectionTableInner, user_id: i64, stream_id: Uuid) {
        if let Some(streams) = guard.user_streams.get_mut(&user_id) {
            streams.remove(&stream_id);
            if streams.is_empty() {
                guard.user_streams.remove(&user_id);
            }
        }
        guard.connect_time.remove(&stream_id);

        let Some((_, event_type)) = guard.stream_owner.remove(&stream_id) else {
            return;
        };

        let still_has_type = guard
            .stream_owner
            .values()
            .any(|(uid, et)| *uid == user_id && *et == event_type);
        if !still_has_type {
            if let Some(set) = guard.eventtype_users.get_mut(&event_type) {
                set.remove(&user_id);
                if set.is_empty() {
                    guard.eventtype_users.remove(&event_type);
                }
            }
        }
    }

    /// Purges every stream belonging to `user_id`. The set of stream ids to
    /// purge is enumerated from the table itself, never inferred from
    /// stream_id content.
    pub fn remove_all_connections(&self, user_id: i64) {
        let mut guard = self.inner.lock().unwrap();
        let stream_ids: Vec<Uuid> = guard
            .user_streams
            .get(&user_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        for sid in stream_ids {
            Self::remove_locked(&mut guard, user_id, sid);
        }
    }

    pub fn get_user_streams(&self, user_id: i64) -> Vec<Arc<Mailbox>> {
        let guard = self.inner.lock().unwrap();
        guard
            .user_streams
            .get(&user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_all_streams(&self) -> Vec<Arc<Mailbox>> {
        let guard = self.inner.lock().unwrap();
        guard
            .user_streams
            .values()
            .flat_map(|m| m.values().cloned())
            .collect()
    }

    pub fn get_eventtype_users(&self, event_type: &str) -> HashSet<i64> {
        let guard = self.inner.lock().unwrap();
        guard
            .eventtype_users
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        let guard = self.inner.lock().unwrap();
        guard
            .user_streams
            .get(&user_id)
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }

    pub fn online_user_ids(&self) -> Vec<i64> {
        let guard = self.inner.lock().unwrap();
        guard.user_streams.keys().copied().collect()
    }
}
