//! Batched, append-only event log writer.
//!
//! Audit events are buffered in-process and flushed to the `EventStore` in
//! batches rather than one write per event, the same trade spec.md §4.5
//! describes: a size threshold (100 events) or a time threshold (1s),
//! whichever comes first. A flush failure is retried with backoff without
//! reordering the batch — later events never overtake an unflushed earlier
//! one — and PII fields in `detail` are redacted before the batch ever
//! leaves the process.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

use crate::model::AuditEvent;
use crate::store::EventStore;

pub const FLUSH_SIZE_THRESHOLD: usize = 100;
pub const FLUSH_TIME_THRESHOLD: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 4096;
const MAX_FLUSH_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log writer has shut down")]
    Closed,
}

/// Fields on `AuditEvent::detail` that are redacted before persistence.
/// Keeps the audit trail useful for debugging without leaking user content
/// into a store that may have weaker access controls than the broker.
const REDACTED_DETAIL_KEYS: &[&str] = &["payload", "context", "prompt", "raw_input"];

fn redact(mut event: AuditEvent) -> AuditEvent {
    if let Some(detail) = event.detail.as_mut() {
        if let Some(obj) = detail.as_object_mut() {
            for key in REDACTED_DETAIL_KEYS {
                if obj.contains_key(*key) {
                    obj.insert((*key).to_string(), serde_json::Value::String("[redacted]".into()));
                }
            }
        }
    }
    event
}

/// Handle for submitting audit events; the background flush loop owns the
/// receiving end and the store.
#[derive(Clone)]
pub struct EventLogWriter {
    sender: mpsc::Sender<AuditEvent>,
}

impl EventLogWriter {
    /// Spawn the background flush task and return a writer handle.
    pub fn spawn(store: Arc<dyn EventStore>) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(flush_loop(store, receiver));
        Self { sender }
    }

    pub async fn record(&self, event: AuditEvent) -> Result<(), EventLogError> {
        self.sender
            .send(redact(event))
            .await
            .map_err(|_| EventLogError::Closed)
    }
}

async fn flush_loop(store: Arc<dyn EventStore>, mut receiver: mpsc::Receiver<AuditEvent>) {
    let mut batch = Vec::with_capacity(FLUSH_SIZE_THRESHOLD);
    let mut ticker = tokio::time::interval(FLUSH_TIME_THRESHOLD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_event = receiver.recv() => {
                match maybe_event {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= FLUSH_SIZE_THRESHOLD {
                            flush_batch(&store, &mut batch).await;
                        }
                    }
                    None => {
                        flush_batch(&store, &mut batch).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush_batch(&store, &mut batch).await;
                }
            }
        }
    }
}

/// Flush `batch` in order, retrying the whole remaining tail on failure
/// rather than reordering around a stuck event.
async fn flush_batch(store: &Arc<dyn EventStore>, batch: &mut Vec<AuditEvent>) {
    let mut backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(MAX_FLUSH_RETRIES)
        .with_jitter()
        .build();

    let mut remaining = std::mem::take(batch);
    let mut cursor = 0;

    'retry: loop {
        while cursor < remaining.len() {
            match store.append_event(&remaining[cursor]).await {
                Ok(()) => cursor += 1,
                Err(e) => {
                    match backoff.next() {
                        Some(delay) => {
                            warn!(error = %e, cursor, remaining = remaining.len(), "event log flush failed, retrying");
                            tokio::time::sleep(delay).await;
                            continue 'retry;
                        }
                        None => {
                            error!(error = %e, dropped = remaining.len() - cursor, "event log flush exhausted retries, dropping remaining batch");
                            return;
                        }
                    }
                }
            }
        }
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use crate::store::InMemoryEventStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn writer_flushes_on_time_threshold() {
        let store = Arc::new(InMemoryEventStore::new());
        let writer = EventLogWriter::spawn(store.clone());
        let msg_id = Uuid::new_v4();

        writer
            .record(AuditEvent::new(msg_id, "acme", EventType::Enqueued))
            .await
            .unwrap();

        tokio::time::sleep(FLUSH_TIME_THRESHOLD + Duration::from_millis(200)).await;

        let events = store.list_events("acme", msg_id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn writer_flushes_immediately_at_size_threshold() {
        let store = Arc::new(InMemoryEventStore::new());
        let writer = EventLogWriter::spawn(store.clone());
        let msg_id = Uuid::new_v4();

        for _ in 0..FLUSH_SIZE_THRESHOLD {
            writer
                .record(AuditEvent::new(msg_id, "acme", EventType::Enqueued))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = store.list_events("acme", msg_id).await.unwrap();
        assert_eq!(events.len(), FLUSH_SIZE_THRESHOLD);
    }

    #[test]
    fn redact_masks_sensitive_detail_keys() {
        let event = AuditEvent::new(Uuid::new_v4(), "acme", EventType::Completed)
            .with_detail(serde_json::json!({"payload": "secret", "stage": "done"}));
        let redacted = redact(event);
        let detail = redacted.detail.unwrap();
        assert_eq!(detail["payload"], serde_json::json!("[redacted]"));
        assert_eq!(detail["stage"], serde_json::json!("done"));
    }
}
