//! Dead-letter publishing and replay/purge operations.
//!
//! `DeadLetterPublisher` mirrors the teacher's trait-based multi-backend
//! publisher: a no-op for unconfigured environments, an in-memory channel
//! for standalone/test mode, and an AMQP-backed publisher for production,
//! all selected through `DlqConfig`/`DlqBackend` the same way.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool};
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::DlqRecord;
use crate::store::EventStore;
use crate::topology::dlq_exchange;

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("failed to connect: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("record not found: org={org_id} message={message_id}")]
    NotFound { org_id: String, message_id: Uuid },
    #[error("record is not replayable: org={org_id} message={message_id}")]
    NotReplayable { org_id: String, message_id: Uuid },
}

#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn publish(&self, record: DlqRecord) -> Result<(), DlqError>;

    fn is_configured(&self) -> bool {
        true
    }
}

/// Logs and drops. Used when no DLQ backend is configured.
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(&self, record: DlqRecord) -> Result<(), DlqError> {
        warn!(
            org_id = %record.org_id,
            message_id = %record.original_message.message_id,
            reason = ?record.reason,
            "DLQ not configured, logging dead letter"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// In-memory publisher for standalone mode and tests.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DlqRecord>,
}

impl ChannelDeadLetterPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DlqRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, record: DlqRecord) -> Result<(), DlqError> {
        self.sender
            .send(record)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

/// AMQP-backed publisher: publishes into the org's fanout DLQ exchange and
/// mirrors the record into the event store so `dlq-replay`/`dlq-purge` have
/// something to list and act on.
pub struct AmqpDeadLetterPublisher {
    pool: Pool,
    store: Arc<dyn EventStore>,
}

impl AmqpDeadLetterPublisher {
    pub async fn new(amqp_url: &str, store: Arc<dyn EventStore>) -> Result<Self, DlqError> {
        let manager = Manager::new(amqp_url.to_string(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(5)
            .build()
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let conn = pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;
        channel
            .exchange_declare(
                "agentqueue.dlq.fanout",
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!("AMQP DLQ publisher connected");
        Ok(Self { pool, store })
    }
}

#[async_trait]
impl DeadLetterPublisher for AmqpDeadLetterPublisher {
    async fn publish(&self, record: DlqRecord) -> Result<(), DlqError> {
        let exchange = dlq_exchange(&record.org_id);
        let payload = serde_json::to_vec(&record)?;

        let conn = self.pool.get().await.map_err(|e| DlqError::Connection(e.to_string()))?;
        let channel = conn.create_channel().await?;
        channel
            .basic_publish(
                &exchange,
                "",
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;

        self.store.put_dlq_record(&record).await?;
        Ok(())
    }
}

/// Replay a previously dead-lettered message: pulls its record out of the
/// store, requires `can_replay`, and hands the caller the original message
/// to re-publish. Does not itself call `Producer::publish` so callers can
/// decide whether to reset retry_count/priority first.
pub async fn replay(
    store: &dyn EventStore,
    org_id: &str,
    message_id: Uuid,
) -> Result<crate::model::Message, DlqError> {
    let record = store
        .list_dlq_records(org_id)
        .await?
        .into_iter()
        .find(|r| r.original_message.message_id == message_id)
        .ok_or_else(|| DlqError::NotFound {
            org_id: org_id.to_string(),
            message_id,
        })?;

    if !record.can_replay {
        return Err(DlqError::NotReplayable {
            org_id: org_id.to_string(),
            message_id,
        });
    }

    store.delete_dlq_record(org_id, message_id).await?;
    Ok(record.original_message)
}

/// Purge a dead-lettered message permanently (no replay).
pub async fn purge(store: &dyn EventStore, org_id: &str, message_id: Uuid) -> Result<(), DlqError> {
    store.delete_dlq_record(org_id, message_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CreatedBy, CreatorKind, DlqReason, ErrorHistoryEntry, Message, MessageType, Priority};
    use crate::store::InMemoryEventStore;

    fn sample_record(can_replay: bool) -> DlqRecord {
        DlqRecord {
            org_id: "acme".into(),
            original_message: Message {
                message_id: Uuid::new_v4(),
                org_id: "acme".into(),
                agent_id: Some("agent-1".into()),
                user_id: None,
                goal_id: Uuid::new_v4(),
                task_id: Uuid::new_v4(),
                parent_message_id: None,
                created_by: CreatedBy {
                    kind: CreatorKind::User,
                    id: "u1".into(),
                },
                message_type: MessageType::ModelCall,
                priority: Priority::P3,
                created_at: chrono::Utc::now(),
                expires_at: None,
                retry_count: 3,
                max_retries: 3,
                schema_version: "1.0.0".into(),
                dedup_key: Some("k1".into()),
                context: serde_json::Value::Null,
                resource_limits: None,
                payload: serde_json::json!({}),
                no_demote: false,
            },
            error_history: vec![ErrorHistoryEntry {
                error_kind: "transient_io".into(),
                detail: "timeout".into(),
                retry_count_at_failure: 3,
                occurred_at: chrono::Utc::now(),
            }],
            can_replay,
            dlq_timestamp: chrono::Utc::now(),
            reason: DlqReason::RetriesExhausted,
        }
    }

    #[tokio::test]
    async fn replay_returns_message_and_removes_record() {
        let store = InMemoryEventStore::new();
        let record = sample_record(true);
        let message_id = record.original_message.message_id;
        store.put_dlq_record(&record).await.unwrap();

        let replayed = replay(&store, "acme", message_id).await.unwrap();
        assert_eq!(replayed.message_id, message_id);
        assert!(store.list_dlq_records("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_refuses_non_replayable_records() {
        let store = InMemoryEventStore::new();
        let record = sample_record(false);
        let message_id = record.original_message.message_id;
        store.put_dlq_record(&record).await.unwrap();

        let err = replay(&store, "acme", message_id).await.unwrap_err();
        assert!(matches!(err, DlqError::NotReplayable { .. }));
    }

    #[tokio::test]
    async fn purge_removes_the_record() {
        let store = InMemoryEventStore::new();
        let record = sample_record(true);
        let message_id = record.original_message.message_id;
        store.put_dlq_record(&record).await.unwrap();

        purge(&store, "acme", message_id).await.unwrap();
        assert!(store.list_dlq_records("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn noop_publisher_reports_unconfigured() {
        let publisher = NoopDeadLetterPublisher;
        assert!(!publisher.is_configured());
        assert!(publisher.publish(sample_record(true)).await.is_ok());
    }

    #[tokio::test]
    async fn channel_publisher_forwards_records() {
        let (publisher, mut receiver) = ChannelDeadLetterPublisher::new();
        let record = sample_record(true);
        let message_id = record.original_message.message_id;
        publisher.publish(record).await.unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.original_message.message_id, message_id);
    }
}
