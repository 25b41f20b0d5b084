//! PostgreSQL-backed `EventStore`.
//!
//! Messages, audit events and DLQ records are stored as JSONB blobs keyed by
//! `(org_id, message_id)` rather than normalized into per-field columns —
//! the wire shapes in `crate::model` are the schema. Idempotency keys and
//! poison counters get their own narrow tables since they're queried by key
//! only and benefit from a real `UNIQUE`/upsert constraint.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{EventStore, Result, StoreError};
use crate::model::{AuditEvent, DlqRecord, IdempotencyKey, Message};

pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing tables if they don't already exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                org_id TEXT NOT NULL,
                message_id UUID NOT NULL,
                body JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (org_id, message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_events (
                event_id UUID PRIMARY KEY,
                org_id TEXT NOT NULL,
                message_id UUID NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                body JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS message_events_by_message ON message_events (org_id, message_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                org_id TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                claimed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (org_id, dedup_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poison_counters (
                org_id TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (org_id, dedup_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dlq_messages (
                org_id TEXT NOT NULL,
                message_id UUID NOT NULL,
                body JSONB NOT NULL,
                dlq_timestamp TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (org_id, message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn put_message(&self, message: &Message) -> Result<()> {
        let body = serde_json::to_value(message)?;
        sqlx::query(
            r#"
            INSERT INTO messages (org_id, message_id, body, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (org_id, message_id) DO UPDATE SET body = EXCLUDED.body, updated_at = now()
            "#,
        )
        .bind(&message.org_id)
        .bind(message.message_id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_message(&self, org_id: &str, message_id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT body FROM messages WHERE org_id = $1 AND message_id = $2")
            .bind(org_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let body: serde_json::Value = row.get("body");
                Ok(Some(serde_json::from_value(body)?))
            }
            None => Ok(None),
        }
    }

    async fn append_event(&self, event: &AuditEvent) -> Result<()> {
        let body = serde_json::to_value(event)?;
        sqlx::query(
            "INSERT INTO message_events (event_id, org_id, message_id, occurred_at, body) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.event_id)
        .bind(&event.org_id)
        .bind(event.message_id)
        .bind(event.occurred_at)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_events(&self, org_id: &str, message_id: Uuid) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query(
            "SELECT body FROM message_events WHERE org_id = $1 AND message_id = $2 ORDER BY occurred_at ASC",
        )
        .bind(org_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let body: serde_json::Value = row.get("body");
                serde_json::from_value(body).map_err(StoreError::from)
            })
            .collect()
    }

    async fn claim_idempotency_key(&self, key: &IdempotencyKey) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO idempotency_keys (org_id, dedup_key) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(&key.org_id)
        .bind(&key.dedup_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_idempotency_key(&self, key: &IdempotencyKey) -> Result<()> {
        sqlx::query("DELETE FROM idempotency_keys WHERE org_id = $1 AND dedup_key = $2")
            .bind(&key.org_id)
            .bind(&key.dedup_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_poison_counter(&self, key: &IdempotencyKey) -> Result<u32> {
        let row = sqlx::query(
            r#"
            INSERT INTO poison_counters (org_id, dedup_key, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (org_id, dedup_key) DO UPDATE SET count = poison_counters.count + 1
            RETURNING count
            "#,
        )
        .bind(&key.org_id)
        .bind(&key.dedup_key)
        .fetch_one(&self.pool)
        .await?;
        let count: i32 = row.get("count");
        Ok(count as u32)
    }

    async fn get_poison_counter(&self, key: &IdempotencyKey) -> Result<u32> {
        let row = sqlx::query("SELECT count FROM poison_counters WHERE org_id = $1 AND dedup_key = $2")
            .bind(&key.org_id)
            .bind(&key.dedup_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i32, _>("count") as u32).unwrap_or(0))
    }

    async fn reset_poison_counter(&self, key: &IdempotencyKey) -> Result<()> {
        sqlx::query("DELETE FROM poison_counters WHERE org_id = $1 AND dedup_key = $2")
            .bind(&key.org_id)
            .bind(&key.dedup_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_dlq_record(&self, record: &DlqRecord) -> Result<()> {
        let body = serde_json::to_value(record)?;
        sqlx::query(
            r#"
            INSERT INTO dlq_messages (org_id, message_id, body, dlq_timestamp)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (org_id, message_id) DO UPDATE SET body = EXCLUDED.body, dlq_timestamp = EXCLUDED.dlq_timestamp
            "#,
        )
        .bind(&record.org_id)
        .bind(record.original_message.message_id)
        .bind(body)
        .bind(record.dlq_timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_dlq_records(&self, org_id: &str) -> Result<Vec<DlqRecord>> {
        let rows = sqlx::query(
            "SELECT body FROM dlq_messages WHERE org_id = $1 ORDER BY dlq_timestamp DESC",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let body: serde_json::Value = row.get("body");
                serde_json::from_value(body).map_err(StoreError::from)
            })
            .collect()
    }

    async fn delete_dlq_record(&self, org_id: &str, message_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM dlq_messages WHERE org_id = $1 AND message_id = $2")
            .bind(org_id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Run with: DATABASE_URL=postgres://... cargo test --features postgres -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::model::{CreatedBy, CreatorKind, MessageType, Priority};

    async fn connect() -> PostgresEventStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this test");
        let pool = PgPool::connect(&url).await.expect("connect to postgres");
        let store = PostgresEventStore::new(pool);
        store.init().await.expect("init schema");
        store
    }

    fn sample_message(org_id: &str) -> Message {
        Message {
            message_id: Uuid::new_v4(),
            org_id: org_id.to_string(),
            agent_id: Some("agent-1".into()),
            user_id: None,
            goal_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            parent_message_id: None,
            created_by: CreatedBy { kind: CreatorKind::User, id: "u1".into() },
            message_type: MessageType::ModelCall,
            priority: Priority::P1,
            created_at: chrono::Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
            schema_version: "1.0.0".into(),
            dedup_key: Some(format!("k-{}", Uuid::new_v4())),
            context: serde_json::Value::Null,
            resource_limits: None,
            payload: serde_json::json!({"hello": "world"}),
            no_demote: false,
        }
    }

    #[tokio::test]
    #[ignore = "requires a running postgres instance"]
    async fn put_and_get_message_round_trips() {
        let store = connect().await;
        let message = sample_message("test-org");
        store.put_message(&message).await.expect("put");
        let fetched = store
            .get_message(&message.org_id, message.message_id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.message_id, message.message_id);
        assert_eq!(fetched.payload, message.payload);
    }

    #[tokio::test]
    #[ignore = "requires a running postgres instance"]
    async fn claim_idempotency_key_is_exclusive() {
        let store = connect().await;
        let key = IdempotencyKey { org_id: "test-org".into(), dedup_key: format!("k-{}", Uuid::new_v4()) };
        assert!(store.claim_idempotency_key(&key).await.expect("first claim"));
        assert!(!store.claim_idempotency_key(&key).await.expect("second claim"));
    }

    #[tokio::test]
    #[ignore = "requires a running postgres instance"]
    async fn poison_counter_increments_and_resets() {
        let store = connect().await;
        let key = IdempotencyKey { org_id: "test-org".into(), dedup_key: format!("k-{}", Uuid::new_v4()) };
        assert_eq!(store.increment_poison_counter(&key).await.expect("inc"), 1);
        assert_eq!(store.increment_poison_counter(&key).await.expect("inc"), 2);
        store.reset_poison_counter(&key).await.expect("reset");
        assert_eq!(store.increment_poison_counter(&key).await.expect("inc"), 1);
    }
}
