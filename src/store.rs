use crate::models::EventRow;
use crate::registry::EventRowInsert;
use async_trait::async_trait;
use sqlx::PgPool;

/// Result of a `mark_read` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkReadOutcome {
    Ok,
    AlreadyRead,
    NotFound,
}

/// Durable persistence for events. Abstracted behind a trait (ground:
/// `MessageQueueBackend` in the notification-service queue backend) so the
/// EventManager can be exercised in tests without a live Postgres
/// instance, while the production path talks to `PgEventStore`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert(&self, row: EventRowInsert) -> Result<i64, sqlx::Error>;
    async fn mark_read(&self, event_id: i64, user_id: i64) -> Result<MarkReadOutcome, sqlx::Error>;
    async fn bulk_mark_read(&self, event_ids: &[i64], user_id: i64) -> Result<u64, sqlx::Error>;
    async fn fetch_unread(&self, user_id: i64) -> Result<Vec<EventRow>, sqlx::Error>;
    async fn fetch_unread_by_type(
        &self,
        user_id: i64,
        event_type: &str,
    ) -> Result<Vec<EventRow>, sqlx::Error>;
    async fn delete(&self, event_id: i64) -> Result<(), sqlx::Error>;
    async fn delete_batch(&self, event_ids: &[i64]) -> Result<(), sqlx::Error>;
    async fn purge_stale(&self) -> Result<u64, sqlx::Error>;
}

/// Postgres-backed store. Every operation opens and commits its own
/// transaction (mirrors `notifications::event_bus::enqueue_event` and
/// `gl::repos`' transaction-per-call style) rather than holding a session
/// open across calls.
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        PgEventStore { pool }
    }
}

#[async_trait]
impl Store for PgEventStore {
    async fn insert(&self, row: EventRowInsert) -> Result<i64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO event (event_type, payload, target_userid, priority, is_read, created_at, expired_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&row.event_type)
        .bind(&row.payload)
        .bind(row.target_userid)
        .bind(&row.priority)
        .bind(row.is_read)
        .bind(row.created_at)
        .bind(row.expired_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn mark_read(&self, event_id: i64, user_id: i64) -> Result<MarkReadOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(bool, i64)> = sqlx::query_as(
            "SELECT is_read, target_userid FROM event WHERE id = $1",
        )
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => MarkReadOutcome::NotFound,
            Some((_, target)) if target != user_id => MarkReadOutcome::NotFound,
            Some((true, _)) => MarkReadOutcome::AlreadyRead,
            Some((false, _)) => {
                sqlx::query("UPDATE event SET is_read = true WHERE id = $1 AND target_userid = $2")
                    .bind(event_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?;
                MarkReadOutcome::Ok
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn bulk_mark_read(&self, event_ids: &[i64], user_id: i64) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE event SET is_read = true WHERE id = ANY($1) AND target_userid = $2 AND is_read = false",
        )
        .bind(event_ids)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn fetch_unread(&self, user_id: i64) -> Result<Vec<EventRow>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, event_type, payload, target_userid, priority, is_read, created_at, expired_at
            FROM event
            WHERE target_userid = $1 AND is_read = false
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn fetch_unread_by_type(
        &self,
        user_id: i64,
        event_type: &str,
    ) -> Result<Vec<EventRow>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, event_type, payload, target_userid, priority, is_read, created_at, expired_at
            FROM event
            WHERE target_userid = $1 AND event_type = $2 AND is_read = false
            ORDER BY
                CASE priority
                    WHEN 'CRITICAL' THEN 3
                    WHEN 'HIGH' THEN 2
                    WHEN 'NORMAL' THEN 1
                    ELSE 0
                END DESC,
                created_at ASC
            "#,
        )
        .bind(user_id)
        .bind(event_type)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn delete(&self, event_id: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM event WHERE id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_batch(&self, event_ids: &[i64]) -> Result<(), sqlx::Error> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM event WHERE id = ANY($1)")
            .bind(event_ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn purge_stale(&self) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM event WHERE is_read = true OR expired_at <= now()")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

/// In-memory store used by tests that exercise `EventManager`/
/// `ConnectionManager` behaviour deterministically, without a database.
pub mod memory {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryEventStore {
        rows: Mutex<Vec<EventRow>>,
        next_id: Mutex<i64>,
    }

    impl MemoryEventStore {
        pub fn new() -> Self {
            MemoryEventStore {
                rows: Mutex::new(Vec::new()),
                next_id: Mutex::new(1),
            }
        }

        pub fn row_count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }

        pub fn all_rows(&self) -> Vec<EventRow> {
            self.rows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Store for MemoryEventStore {
        async fn insert(&self, row: EventRowInsert) -> Result<i64, sqlx::Error> {
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            self.rows.lock().unwrap().push(EventRow {
                id,
                event_type: row.event_type,
                payload: row.payload,
                target_userid: row.target_userid,
                priority: row.priority,
                is_read: row.is_read,
                created_at: row.created_at,
                expired_at: row.expired_at,
            });
            Ok(id)
        }

        async fn mark_read(
            &self,
            event_id: i64,
            user_id: i64,
        ) -> Result<MarkReadOutcome, sqlx::Error> {
            let mut rows = self.rows.lock().unwrap();
            let Some(row) = rows.iter_mut().find(|r| r.id == event_id) else {
                return Ok(MarkReadOutcome::NotFound);
            };
            if row.target_userid != user_id {
                return Ok(MarkReadOutcome::NotFound);
            }
            if row.is_read {
                return Ok(MarkReadOutcome::AlreadyRead);
            }
            row.is_read = true;
            Ok(MarkReadOutcome::Ok)
        }

        async fn bulk_mark_read(&self, event_ids: &[i64], user_id: i64) -> Result<u64, sqlx::Error> {
            let mut rows = self.rows.lock().unwrap();
            let mut count = 0u64;
            for row in rows.iter_mut() {
                if event_ids.contains(&row.id) && row.target_userid == user_id && !row.is_read {
                    row.is_read = true;
                    count += 1;
                }
            }
            Ok(count)
        }

        async fn fetch_unread(&self, user_id: i64) -> Result<Vec<EventRow>, sqlx::Error> {
            let rows = self.rows.lock().unwrap();
            let mut out: Vec<EventRow> = rows
                .iter()
                .filter(|r| r.target_userid == user_id && !r.is_read)
                .cloned()
                .collect();
            out.sort_by_key(|r| r.created_at);
            Ok(out)
        }

        async fn fetch_unread_by_type(
            &self,
            user_id: i64,
            event_type: &str,
        ) -> Result<Vec<EventRow>, sqlx::Error> {
            let rows = self.rows.lock().unwrap();
            let mut out: Vec<EventRow> = rows
                .iter()
                .filter(|r| r.target_userid == user_id && r.event_type == event_type && !r.is_read)
                .cloned()
                .collect();
            out.sort_by(|a, b| {
                let rank = |p: &str| match p {
                    "CRITICAL" => 3,
                    "HIGH" => 2,
                    "NORMAL" => 1,
                    _ => 0,
                };
                rank(&b.priority)
                    .cmp(&rank(&a.priority))
                    .then(a.created_at.cmp(&b.created_at))
            });
            Ok(out)
        }

        async fn delete(&self, event_id: i64) -> Result<(), sqlx::Error> {
            self.rows.lock().unwrap().retain(|r| r.id != event_id);
            Ok(())
        }

        async fn delete_batch(&self, event_ids: &[i64]) -> Result<(), sqlx::Error> {
            self.rows.lock().unwrap().retain(|r| !event_ids.contains(&r.id));
            Ok(())
        }

        async fn purge_stale(&self) -> Result<u64, sqlx::Error> {
            let mut rows = self.rows.lock().unwrap();
            let now = Utc::now();
            let before = rows.len();
            rows.retain(|r| !(r.is_read || r.expired_at.map(|e| e <= now).unwrap_or(false)));
            Ok((before - rows.len()) as u64)
        }
    }

}
