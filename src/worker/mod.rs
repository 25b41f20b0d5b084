//! The worker: bounded-concurrency consumer, error-policy-driven
//! retry/demotion, response emission, and poison/DLQ handoff.
//!
//! Grounded on `consume_with_reconnect`/`process_delivery` for the
//! reconnect-and-dispatch shape, and `utils::retry::RetryConfig` for the
//! exponential+jitter delay calculation, generalized from "retry the AMQP
//! operation" to "retry the business message" per spec.md §4.3/§7.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::{FutureExt, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, BasicPublishOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::dlq::DeadLetterPublisher;
use crate::event_log::EventLogWriter;
use crate::model::{AuditEvent, DlqRecord, Envelope, ErrorHistoryEntry, EventType, Message, Priority, Response};
use crate::poison::PoisonTracker;
use crate::store::EventStore;
use crate::topology::{priority_queue, priority_routing_key, requests_exchange};

/// The error taxonomy spec.md §7 maps to retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    UnsupportedSchema,
    PermanentUpstream,
    RateLimit,
    TransientIo,
    HandlerTimeout,
    Unknown,
}

impl ErrorKind {
    pub fn is_retriable(self) -> bool {
        !matches!(
            self,
            ErrorKind::Validation | ErrorKind::UnsupportedSchema | ErrorKind::PermanentUpstream
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::UnsupportedSchema => "unsupported_schema",
            ErrorKind::PermanentUpstream => "permanent_upstream",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::HandlerTimeout => "handler_timeout",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Base retry delay per spec.md §7: rate limits back off harder than
    /// plain transient IO, and handler timeouts back off linearly rather
    /// than exponentially since a slow handler is expected to take roughly
    /// as long on every attempt.
    fn base_delay(self) -> Duration {
        match self {
            ErrorKind::RateLimit => Duration::from_secs(1),
            ErrorKind::TransientIo => Duration::from_millis(500),
            ErrorKind::HandlerTimeout => Duration::from_secs(5),
            ErrorKind::Unknown => Duration::from_secs(1),
            _ => Duration::from_secs(1),
        }
    }

    /// Cap on the exponential backoff for the non-linear kinds.
    fn max_delay(self) -> Duration {
        match self {
            ErrorKind::RateLimit => Duration::from_secs(60),
            ErrorKind::TransientIo | ErrorKind::Unknown => Duration::from_secs(30),
            ErrorKind::HandlerTimeout => Duration::from_secs(5),
            _ => Duration::from_secs(30),
        }
    }

    fn is_linear(self) -> bool {
        matches!(self, ErrorKind::HandlerTimeout)
    }

    /// The delay before the `retry_count`'th redelivery attempt. Handler
    /// timeouts grow linearly (a constant 5s step); everything else grows
    /// exponentially up to its cap.
    fn retry_delay(self, retry_count: u32) -> Duration {
        if self.is_linear() {
            let linear = self.base_delay() * retry_count.max(1);
            return linear.min(self.max_delay());
        }
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay())
            .with_max_delay(self.max_delay())
            .with_max_times(retry_count.max(1) as usize)
            .with_jitter()
            .build()
            .last()
            .unwrap_or_else(|| self.base_delay())
    }
}

#[derive(Debug, Error)]
#[error("{kind_str}: {detail}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub kind_str: &'static str,
    pub detail: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            kind_str: kind.as_str(),
            detail: detail.into(),
        }
    }
}

/// Business logic a worker dispatches decoded messages to.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<Response, HandlerError>;
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("pool error: {0}")]
    Pool(String),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("dlq error: {0}")]
    Dlq(#[from] crate::dlq::DlqError),
}

pub struct WorkerConfig {
    pub org_id: String,
    pub priority: Priority,
    pub prefetch: u16,
    pub concurrency: usize,
}

/// One worker binds to a single priority queue for one org. Running the
/// full priority ladder means spawning one `Worker::run` per `Priority`.
pub struct Worker {
    pool: deadpool_lapin::Pool,
    store: Arc<dyn EventStore>,
    poison: Arc<PoisonTracker>,
    dlq: Arc<dyn DeadLetterPublisher>,
    event_log: EventLogWriter,
    handler: Arc<dyn Handler>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        pool: deadpool_lapin::Pool,
        store: Arc<dyn EventStore>,
        poison: Arc<PoisonTracker>,
        dlq: Arc<dyn DeadLetterPublisher>,
        event_log: EventLogWriter,
        handler: Arc<dyn Handler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            pool,
            store,
            poison,
            dlq,
            event_log,
            handler,
            config,
        }
    }

    /// Consume until the connection drops, then return (caller supervises
    /// reconnection, mirroring `consume_with_reconnect`'s outer loop being
    /// the thing that's long-lived, not this method).
    pub async fn run_once(&self) -> Result<(), WorkerError> {
        let queue = priority_queue(&self.config.org_id, self.config.priority);
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| WorkerError::Pool(e.to_string()))?;
        let channel = conn.create_channel().await?;

        // effective concurrency = min(prefetch, concurrency) per spec.md §5
        let effective_concurrency = (self.config.prefetch as usize).min(self.config.concurrency).max(1);
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        let mut consumer = channel
            .basic_consume(
                &queue,
                "agentqueue-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let semaphore = Arc::new(Semaphore::new(effective_concurrency));

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(e) => {
                    error!(error = %e, "consumer delivery error, reconnecting");
                    break;
                }
            };

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let channel = channel.clone();
            let store = self.store.clone();
            let poison = self.poison.clone();
            let dlq = self.dlq.clone();
            let event_log = self.event_log.clone();
            let handler = self.handler.clone();

            tokio::spawn(async move {
                let _permit = permit;
                process_delivery(delivery, channel, store, poison, dlq, event_log, handler).await;
            });
        }

        Ok(())
    }
}

async fn process_delivery(
    delivery: lapin::message::Delivery,
    channel: Channel,
    store: Arc<dyn EventStore>,
    poison: Arc<PoisonTracker>,
    dlq: Arc<dyn DeadLetterPublisher>,
    event_log: EventLogWriter,
    handler: Arc<dyn Handler>,
) {
    let envelope: Envelope = match serde_json::from_slice(&delivery.data) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "failed to decode envelope, rejecting without requeue");
            let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
            return;
        }
    };

    let message = envelope.into_message();
    let _ = event_log
        .record(AuditEvent::new(message.message_id, &message.org_id, EventType::Dequeued).with_priority(message.priority))
        .await;

    let already_quarantined = poison
        .is_quarantined(&message.org_id, message.dedup_key.as_deref())
        .await
        .unwrap_or(false);
    if already_quarantined {
        warn!(org_id = %message.org_id, message_id = %message.message_id, "message already over poison threshold, routing to dlq without invoking handler");
        let quarantined = HandlerError::new(ErrorKind::Unknown, "poison counter already over threshold");
        handle_failure_inner(&delivery, &channel, &store, &dlq, &event_log, &message, quarantined, true).await;
        return;
    }

    let _ = event_log
        .record(AuditEvent::new(message.message_id, &message.org_id, EventType::Processing).with_priority(message.priority))
        .await;

    let handler_result = std::panic::AssertUnwindSafe(handler.handle(&message))
        .catch_unwind()
        .await;

    match handler_result {
        Ok(Ok(response)) => {
            let _ = event_log
                .record(AuditEvent::new(message.message_id, &message.org_id, EventType::Completed))
                .await;
            let _ = store.reset_poison_counter_for(&message).await;
            let _ = delivery.ack(BasicAckOptions::default()).await;
            emit_response(&channel, &message, response).await;
        }
        Ok(Err(handler_err)) => {
            handle_failure(&delivery, &channel, &store, &dlq, &event_log, &message, handler_err).await;
        }
        Err(_panic) => {
            let crashed = HandlerError::new(ErrorKind::Unknown, "handler panicked");
            let crossed_threshold = poison
                .record_crash(&message.org_id, message.dedup_key.as_deref())
                .await
                .unwrap_or(false);
            handle_failure_inner(&delivery, &channel, &store, &dlq, &event_log, &message, crashed, crossed_threshold).await;
        }
    }
}

/// Small extension so `process_delivery` can reset the poison counter by
/// message rather than threading a bare `IdempotencyKey` through call sites.
#[async_trait]
trait ResetPoisonExt {
    async fn reset_poison_counter_for(&self, message: &Message) -> crate::store::Result<()>;
}

#[async_trait]
impl ResetPoisonExt for Arc<dyn EventStore> {
    async fn reset_poison_counter_for(&self, message: &Message) -> crate::store::Result<()> {
        if let Some(dedup_key) = &message.dedup_key {
            self.reset_poison_counter(&crate::model::IdempotencyKey {
                org_id: message.org_id.clone(),
                dedup_key: dedup_key.clone(),
            })
            .await?;
        }
        Ok(())
    }
}

/// A handler returning `Err` is a clean, deterministic rejection, not a
/// crash — the poison counter only reacts to panics (see the panic branch
/// in `process_delivery`), so it's untouched here.
async fn handle_failure(
    delivery: &lapin::message::Delivery,
    channel: &Channel,
    store: &Arc<dyn EventStore>,
    dlq: &Arc<dyn DeadLetterPublisher>,
    event_log: &EventLogWriter,
    message: &Message,
    err: HandlerError,
) {
    handle_failure_inner(delivery, channel, store, dlq, event_log, message, err, false).await;
}

async fn handle_failure_inner(
    delivery: &lapin::message::Delivery,
    channel: &Channel,
    store: &Arc<dyn EventStore>,
    dlq: &Arc<dyn DeadLetterPublisher>,
    event_log: &EventLogWriter,
    message: &Message,
    err: HandlerError,
    poisoned: bool,
) {
    let _ = event_log
        .record(
            AuditEvent::new(message.message_id, &message.org_id, EventType::Failed)
                .with_detail(serde_json::json!({"error_kind": err.kind_str, "detail": err.detail})),
        )
        .await;

    let history_entry = ErrorHistoryEntry {
        error_kind: err.kind_str.to_string(),
        detail: err.detail.clone(),
        retry_count_at_failure: message.retry_count,
        occurred_at: chrono::Utc::now(),
    };

    let should_dead_letter = poisoned || !err.kind.is_retriable() || message.exhausted_retries();

    if should_dead_letter {
        let reason = if poisoned {
            crate::model::DlqReason::Poison
        } else {
            crate::model::DlqReason::RetriesExhausted
        };
        let record = DlqRecord {
            org_id: message.org_id.clone(),
            original_message: message.clone(),
            error_history: vec![history_entry],
            can_replay: !poisoned,
            dlq_timestamp: chrono::Utc::now(),
            reason,
        };
        if let Err(e) = dlq.publish(record).await {
            error!(error = %e, "failed to publish dead letter, nacking with requeue to avoid loss");
            let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
            return;
        }
        let _ = event_log
            .record(AuditEvent::new(message.message_id, &message.org_id, EventType::DeadLetter))
            .await;
        let _ = delivery.ack(BasicAckOptions::default()).await;
        return;
    }

    // Retry: demote, bump retry_count, ack the original delivery right away
    // so this worker's concurrency slot frees, then republish after the
    // backoff delay on a detached task that holds no semaphore permit. A
    // sleep inline here would pin the slot for the whole backoff, which is
    // the anti-pattern spec.md §9's design note calls out.
    let original_priority = message.priority;
    let retried = message.clone().demoted_for_retry();
    if let Err(e) = store.put_message(&retried).await {
        error!(error = %e, "failed to persist retried message state");
    }

    let _ = delivery.ack(BasicAckOptions::default()).await;

    let backoff_delay = err.kind.retry_delay(message.retry_count);
    let channel = channel.clone();
    let event_log = event_log.clone();
    tokio::spawn(async move {
        tokio::time::sleep(backoff_delay).await;

        if let Err(e) = republish(&channel, &retried).await {
            error!(error = %e, "failed to republish retried message after backoff delay, message lost");
            return;
        }

        let _ = event_log
            .record(
                AuditEvent::new(retried.message_id, &retried.org_id, EventType::RetryScheduled)
                    .with_priority(retried.priority),
            )
            .await;
        if retried.priority != original_priority {
            let _ = event_log
                .record(AuditEvent::new(retried.message_id, &retried.org_id, EventType::Demoted).with_priority(retried.priority))
                .await;
        }
    });
}

async fn republish(channel: &Channel, message: &Message) -> Result<(), lapin::Error> {
    let envelope = Envelope::wrap(message.clone());
    let payload = serde_json::to_vec(&envelope).unwrap_or_default();
    channel
        .basic_publish(
            &requests_exchange(&message.org_id),
            &priority_routing_key(&message.org_id, message.priority),
            BasicPublishOptions::default(),
            &payload,
            BasicProperties::default().with_delivery_mode(2),
        )
        .await?
        .await?;
    Ok(())
}

async fn emit_response(channel: &Channel, message: &Message, response: Response) {
    let Some(agent_id) = &message.agent_id else {
        return;
    };
    let exchange = crate::topology::responses_exchange(&message.org_id);
    let routing_key = crate::topology::agent_routing_key(&message.org_id, agent_id);
    let payload = match serde_json::to_vec(&response) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            return;
        }
    };
    if let Err(e) = channel
        .basic_publish(
            &exchange,
            &routing_key,
            BasicPublishOptions::default(),
            &payload,
            BasicProperties::default().with_delivery_mode(2),
        )
        .await
    {
        error!(error = %e, "failed to publish response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_retriability_matches_taxonomy() {
        assert!(!ErrorKind::Validation.is_retriable());
        assert!(!ErrorKind::UnsupportedSchema.is_retriable());
        assert!(!ErrorKind::PermanentUpstream.is_retriable());
        assert!(ErrorKind::RateLimit.is_retriable());
        assert!(ErrorKind::TransientIo.is_retriable());
        assert!(ErrorKind::HandlerTimeout.is_retriable());
        assert!(ErrorKind::Unknown.is_retriable());
    }

    #[test]
    fn rate_limit_backs_off_harder_than_transient_io() {
        assert!(ErrorKind::RateLimit.base_delay() > ErrorKind::TransientIo.base_delay());
    }

    #[test]
    fn retry_delay_table_matches_error_policy() {
        assert_eq!(ErrorKind::RateLimit.base_delay(), Duration::from_secs(1));
        assert_eq!(ErrorKind::RateLimit.max_delay(), Duration::from_secs(60));
        assert_eq!(ErrorKind::TransientIo.base_delay(), Duration::from_millis(500));
        assert_eq!(ErrorKind::TransientIo.max_delay(), Duration::from_secs(30));
        assert_eq!(ErrorKind::Unknown.base_delay(), Duration::from_secs(1));
        assert_eq!(ErrorKind::Unknown.max_delay(), Duration::from_secs(30));
    }

    #[test]
    fn handler_timeout_backs_off_linearly_and_caps_at_its_base() {
        assert!(ErrorKind::HandlerTimeout.is_linear());
        assert_eq!(ErrorKind::HandlerTimeout.retry_delay(1), Duration::from_secs(5));
        assert_eq!(ErrorKind::HandlerTimeout.retry_delay(3), Duration::from_secs(5));
        assert!(!ErrorKind::RateLimit.is_linear());
    }
}
