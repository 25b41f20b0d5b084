//! The `EventStore` contract: the single external arbiter for messages,
//! audit events, idempotency keys, poison counters, and DLQ records.
//!
//! spec.md §9 is explicit that idempotency and poison-tracking must not grow
//! a secondary in-memory cache — the event store is the sole source of
//! truth, so every component that needs to check or bump one of these
//! counters goes through this trait rather than keeping local state.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryEventStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStore;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{AuditEvent, DlqRecord, IdempotencyKey, Message};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message not found: org={org_id} id={message_id}")]
    MessageNotFound { org_id: String, message_id: Uuid },

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("no event_store_url configured and the postgres feature is enabled")]
    NoUrlConfigured,
}

/// Build the configured `EventStore` backend: Postgres when an
/// `event_store_url` is set (and the `postgres` feature is compiled in),
/// in-memory otherwise. Mirrors the teacher's `init_storage` factory that
/// picks a backend off `StorageConfig` rather than having every binary
/// match on it by hand.
pub async fn from_config(config: &crate::config::Config) -> Result<Arc<dyn EventStore>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &config.event_store_url {
        let pool = sqlx::PgPool::connect(url).await?;
        let store = PostgresEventStore::new(pool);
        store.init().await?;
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "postgres"))]
    if config.event_store_url.is_some() {
        return Err(StoreError::NoUrlConfigured);
    }

    Ok(Arc::new(InMemoryEventStore::new()))
}

/// The persistence contract backing the queue core.
///
/// Implementations must make `claim_idempotency_key` atomic: concurrent
/// claims for the same `(org_id, dedup_key)` must result in exactly one
/// caller seeing `true`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist (or update) a message's current state snapshot.
    async fn put_message(&self, message: &Message) -> Result<()>;

    /// Fetch a previously stored message.
    async fn get_message(&self, org_id: &str, message_id: Uuid) -> Result<Option<Message>>;

    /// Append one audit trail row. Never overwrites; strictly additive.
    async fn append_event(&self, event: &AuditEvent) -> Result<()>;

    /// List the audit trail for a message, oldest first.
    async fn list_events(&self, org_id: &str, message_id: Uuid) -> Result<Vec<AuditEvent>>;

    /// Atomically claim a dedup key. Returns `true` if this call is the
    /// first claim (the message should proceed), `false` if it was already
    /// claimed (the message is a duplicate and should be dropped/acked).
    async fn claim_idempotency_key(&self, key: &IdempotencyKey) -> Result<bool>;

    /// Release a claim made by `claim_idempotency_key`, e.g. to roll back a
    /// claim whose publish never reached the broker. A no-op if the key
    /// isn't currently claimed.
    async fn release_idempotency_key(&self, key: &IdempotencyKey) -> Result<()>;

    /// Bump and return the poison counter for a dedup key.
    async fn increment_poison_counter(&self, key: &IdempotencyKey) -> Result<u32>;

    /// Read the current poison counter without bumping it. Used to gate
    /// handler invocation on redelivery of an already-quarantined message.
    async fn get_poison_counter(&self, key: &IdempotencyKey) -> Result<u32>;

    /// Reset a poison counter, e.g. after a message completes successfully.
    async fn reset_poison_counter(&self, key: &IdempotencyKey) -> Result<()>;

    /// Move a message into the dead-letter table.
    async fn put_dlq_record(&self, record: &DlqRecord) -> Result<()>;

    /// List DLQ records for an org, most recent first.
    async fn list_dlq_records(&self, org_id: &str) -> Result<Vec<DlqRecord>>;

    /// Remove a DLQ record, e.g. after a successful replay.
    async fn delete_dlq_record(&self, org_id: &str, message_id: Uuid) -> Result<()>;
}
