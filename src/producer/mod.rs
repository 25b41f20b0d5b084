//! `Producer::publish` — validate, stamp, idempotency-gate, publish with a
//! priority-dependent confirm policy, and emit the audit trail.
//!
//! Grounded on `AmqpEventBus::publish`'s shape: a fresh channel per attempt,
//! exponential backoff with jitter, publisher confirms. P0 is fire-and-forget
//! (never waits on the broker's publisher confirm, so the highest-priority
//! path never blocks on it); P1-P3 wait for the confirm before `publish()`
//! returns and roll back their idempotency claim if the confirm never
//! arrives, so a dedup key isn't burned on a message the broker never durably
//! accepted.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Pool, PoolError};
use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::backpressure::{BackpressureController, BackpressureDecision};
use crate::event_log::EventLogWriter;
use crate::idempotency::IdempotencyGate;
use crate::model::{AuditEvent, Envelope, EventType, Message, Priority};
use crate::store::{EventStore, StoreError};
use crate::topology::{priority_routing_key, requests_exchange};
use crate::validation::{self, ValidationError};

const MAX_PUBLISH_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("message rejected by backpressure controller")]
    Backpressure,
    #[error("failed to get channel from pool: {0}")]
    Pool(String),
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct Producer {
    pool: Pool,
    store: Arc<dyn EventStore>,
    idempotency: IdempotencyGate,
    backpressure: Arc<BackpressureController>,
    event_log: EventLogWriter,
}

impl Producer {
    pub fn new(
        pool: Pool,
        store: Arc<dyn EventStore>,
        backpressure: Arc<BackpressureController>,
        event_log: EventLogWriter,
    ) -> Self {
        let idempotency = IdempotencyGate::new(store.clone());
        Self {
            pool,
            store,
            idempotency,
            backpressure,
            event_log,
        }
    }

    /// Publish a message. Returns `Ok(true)` if the message was accepted and
    /// published, `Ok(false)` if it was a duplicate (dedup key already
    /// claimed) and silently dropped.
    #[tracing::instrument(skip(self, message), fields(org_id = %message.org_id, message_id = %message.message_id))]
    pub async fn publish(&self, message: Message) -> Result<bool, ProducerError> {
        validation::validate_message(&message)?;

        match self.backpressure.admit(&message.org_id).await {
            BackpressureDecision::Admit => {}
            BackpressureDecision::Reject => return Err(ProducerError::Backpressure),
        }

        let admitted = self
            .idempotency
            .admit(&message.org_id, message.dedup_key.as_deref())
            .await?;
        if !admitted {
            debug!("duplicate dedup_key, dropping");
            return Ok(false);
        }

        let message = message.with_generated_ids();
        self.store.put_message(&message).await?;

        if let Err(e) = self.publish_with_retry(&message).await {
            if message.priority != Priority::P0 {
                if let Some(dedup_key) = message.dedup_key.as_deref() {
                    if let Err(release_err) =
                        self.idempotency.release(&message.org_id, dedup_key).await
                    {
                        error!(error = %release_err, "failed to roll back idempotency claim after publish failure");
                    }
                }
            }
            return Err(e);
        }

        let _ = self
            .event_log
            .record(
                AuditEvent::new(message.message_id, &message.org_id, EventType::Created)
                    .with_priority(message.priority),
            )
            .await;
        let _ = self
            .event_log
            .record(
                AuditEvent::new(message.message_id, &message.org_id, EventType::Enqueued)
                    .with_priority(message.priority),
            )
            .await;

        Ok(true)
    }

    async fn publish_with_retry(&self, message: &Message) -> Result<(), ProducerError> {
        let envelope = Envelope::wrap(message.clone());
        let payload = serde_json::to_vec(&envelope)?;
        let exchange = requests_exchange(&message.org_id);
        let routing_key = priority_routing_key(&message.org_id, message.priority);
        let wait_for_confirm = !matches!(message.priority, Priority::P0);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_PUBLISH_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            let channel = match self.get_channel().await {
                Ok(ch) => ch,
                Err(e) => {
                    warn!(attempt, error = %e, "failed to get channel, retrying");
                    last_error = Some(e);
                    continue;
                }
            };

            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2);

            let publish = channel
                .basic_publish(
                    &exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await;

            let confirm = match publish {
                Ok(confirm) => confirm,
                Err(e) => {
                    warn!(attempt, error = %e, "publish failed, retrying");
                    last_error = Some(ProducerError::Amqp(e));
                    continue;
                }
            };

            if wait_for_confirm {
                match confirm.await {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        warn!(attempt, error = %e, "publisher confirm failed, retrying");
                        last_error = Some(ProducerError::Amqp(e));
                        continue;
                    }
                }
            } else {
                return Ok(());
            }
        }

        error!("publish exhausted retries");
        Err(last_error.unwrap_or(ProducerError::Pool("no attempts made".into())))
    }

    async fn get_channel(&self) -> Result<lapin::Channel, ProducerError> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e: PoolError| ProducerError::Pool(e.to_string()))?;
        conn.create_channel()
            .await
            .map_err(ProducerError::Amqp)
    }
}


/// Run with: AMQP_URL=amqp://localhost:5672/%2f cargo test --features amqp -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::backpressure::{BackpressureConfig, BackpressureController, FixedDepthSampler};
    use crate::event_log::EventLogWriter;
    use crate::model::{CreatedBy, CreatorKind, MessageType};
    use crate::store::InMemoryEventStore;
    use crate::topology::TopologyManager;
    use uuid::Uuid;

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string())
    }

    fn sample_message(org_id: &str, priority: Priority) -> Message {
        Message {
            message_id: Uuid::nil(),
            org_id: org_id.to_string(),
            agent_id: Some("agent-1".into()),
            user_id: None,
            goal_id: Uuid::nil(),
            task_id: Uuid::nil(),
            parent_message_id: None,
            created_by: CreatedBy { kind: CreatorKind::User, id: "u1".into() },
            message_type: MessageType::ModelCall,
            priority,
            created_at: chrono::Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
            schema_version: "1.0.0".into(),
            dedup_key: Some(format!("k-{}", Uuid::new_v4())),
            context: serde_json::Value::Null,
            resource_limits: None,
            payload: serde_json::json!({}),
            no_demote: false,
        }
        .with_generated_ids()
    }

    #[tokio::test]
    #[ignore = "requires a running broker"]
    async fn publish_against_declared_topology_succeeds() {
        let org_id = format!("test-org-{}", Uuid::new_v4());
        let manager = TopologyManager::connect(&amqp_url()).await.expect("connect");
        manager.ensure_org_topology(&org_id).await.expect("declare topology");

        let store = Arc::new(InMemoryEventStore::new());
        let backpressure = Arc::new(BackpressureController::new(
            BackpressureConfig::default(),
            Arc::new(FixedDepthSampler::new()),
        ));
        let event_log = EventLogWriter::spawn(store.clone());
        let producer = Producer::new(manager.pool(), store, backpressure, event_log);

        let accepted = producer.publish(sample_message(&org_id, Priority::P0)).await.expect("publish");
        assert!(accepted);
    }

    #[tokio::test]
    #[ignore = "requires a running broker"]
    async fn duplicate_dedup_key_is_dropped_without_republishing() {
        let org_id = format!("test-org-{}", Uuid::new_v4());
        let manager = TopologyManager::connect(&amqp_url()).await.expect("connect");
        manager.ensure_org_topology(&org_id).await.expect("declare topology");

        let store = Arc::new(InMemoryEventStore::new());
        let backpressure = Arc::new(BackpressureController::new(
            BackpressureConfig::default(),
            Arc::new(FixedDepthSampler::new()),
        ));
        let event_log = EventLogWriter::spawn(store.clone());
        let producer = Producer::new(manager.pool(), store, backpressure, event_log);

        let message = sample_message(&org_id, Priority::P2);
        let duplicate = message.clone();
        assert!(producer.publish(message).await.expect("first publish"));
        assert!(!producer.publish(duplicate).await.expect("second publish"));
    }
}
