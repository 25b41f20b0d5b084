//! In-memory `EventStore`, used for tests and standalone/demo mode.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EventStore, Result};
use crate::model::{AuditEvent, DlqRecord, IdempotencyKey, Message};

#[derive(Default)]
pub struct InMemoryEventStore {
    messages: RwLock<HashMap<(String, Uuid), Message>>,
    events: RwLock<HashMap<(String, Uuid), Vec<AuditEvent>>>,
    idempotency_keys: RwLock<std::collections::HashSet<IdempotencyKey>>,
    poison_counters: RwLock<HashMap<IdempotencyKey, u32>>,
    dlq_records: RwLock<HashMap<(String, Uuid), DlqRecord>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn put_message(&self, message: &Message) -> Result<()> {
        self.messages
            .write()
            .await
            .insert((message.org_id.clone(), message.message_id), message.clone());
        Ok(())
    }

    async fn get_message(&self, org_id: &str, message_id: Uuid) -> Result<Option<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .get(&(org_id.to_string(), message_id))
            .cloned())
    }

    async fn append_event(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .write()
            .await
            .entry((event.org_id.clone(), event.message_id))
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_events(&self, org_id: &str, message_id: Uuid) -> Result<Vec<AuditEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(&(org_id.to_string(), message_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn claim_idempotency_key(&self, key: &IdempotencyKey) -> Result<bool> {
        Ok(self.idempotency_keys.write().await.insert(key.clone()))
    }

    async fn release_idempotency_key(&self, key: &IdempotencyKey) -> Result<()> {
        self.idempotency_keys.write().await.remove(key);
        Ok(())
    }

    async fn increment_poison_counter(&self, key: &IdempotencyKey) -> Result<u32> {
        let mut counters = self.poison_counters.write().await;
        let counter = counters.entry(key.clone()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn get_poison_counter(&self, key: &IdempotencyKey) -> Result<u32> {
        Ok(self.poison_counters.read().await.get(key).copied().unwrap_or(0))
    }

    async fn reset_poison_counter(&self, key: &IdempotencyKey) -> Result<()> {
        self.poison_counters.write().await.remove(key);
        Ok(())
    }

    async fn put_dlq_record(&self, record: &DlqRecord) -> Result<()> {
        self.dlq_records.write().await.insert(
            (record.org_id.clone(), record.original_message.message_id),
            record.clone(),
        );
        Ok(())
    }

    async fn list_dlq_records(&self, org_id: &str) -> Result<Vec<DlqRecord>> {
        let mut records: Vec<DlqRecord> = self
            .dlq_records
            .read()
            .await
            .values()
            .filter(|r| r.org_id == org_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.dlq_timestamp.cmp(&a.dlq_timestamp));
        Ok(records)
    }

    async fn delete_dlq_record(&self, org_id: &str, message_id: Uuid) -> Result<()> {
        self.dlq_records
            .write()
            .await
            .remove(&(org_id.to_string(), message_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CreatedBy, CreatorKind, DlqReason, ErrorHistoryEntry, MessageType, Priority};

    fn sample_message(org: &str) -> Message {
        Message {
            message_id: Uuid::new_v4(),
            org_id: org.into(),
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
            priority: Priority::P1,
            created_at: chrono::Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
            schema_version: "1.0.0".into(),
            dedup_key: Some("k1".into()),
            context: serde_json::Value::Null,
            resource_limits: None,
            payload: serde_json::json!({}),
            no_demote: false,
        }
    }

    #[tokio::test]
    async fn put_and_get_message_roundtrips() {
        let store = InMemoryEventStore::new();
        let msg = sample_message("acme");
        store.put_message(&msg).await.unwrap();
        let fetched = store
            .get_message("acme", msg.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.message_id, msg.message_id);
    }

    #[tokio::test]
    async fn missing_message_returns_none() {
        let store = InMemoryEventStore::new();
        assert!(store
            .get_message("acme", Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn idempotency_key_claimed_exactly_once() {
        let store = InMemoryEventStore::new();
        let key = IdempotencyKey {
            org_id: "acme".into(),
            dedup_key: "k1".into(),
        };
        assert!(store.claim_idempotency_key(&key).await.unwrap());
        assert!(!store.claim_idempotency_key(&key).await.unwrap());
    }

    #[tokio::test]
    async fn poison_counter_increments_and_resets() {
        let store = InMemoryEventStore::new();
        let key = IdempotencyKey {
            org_id: "acme".into(),
            dedup_key: "k1".into(),
        };
        assert_eq!(store.increment_poison_counter(&key).await.unwrap(), 1);
        assert_eq!(store.increment_poison_counter(&key).await.unwrap(), 2);
        store.reset_poison_counter(&key).await.unwrap();
        assert_eq!(store.increment_poison_counter(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dlq_records_filtered_by_org_and_sorted_newest_first() {
        let store = InMemoryEventStore::new();
        let msg_a = sample_message("acme");
        let msg_b = sample_message("acme");
        let older = DlqRecord {
            org_id: "acme".into(),
            original_message: msg_a,
            error_history: vec![ErrorHistoryEntry {
                error_kind: "transient_io".into(),
                detail: "boom".into(),
                retry_count_at_failure: 3,
                occurred_at: chrono::Utc::now(),
            }],
            can_replay: true,
            dlq_timestamp: chrono::Utc::now() - chrono::Duration::seconds(60),
            reason: DlqReason::RetriesExhausted,
        };
        let newer = DlqRecord {
            dlq_timestamp: chrono::Utc::now(),
            ..DlqRecord {
                org_id: "acme".into(),
                original_message: msg_b,
                error_history: vec![],
                can_replay: true,
                dlq_timestamp: chrono::Utc::now(),
                reason: DlqReason::Poison,
            }
        };
        store.put_dlq_record(&older).await.unwrap();
        store.put_dlq_record(&newer).await.unwrap();

        let records = store.list_dlq_records("acme").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].original_message.message_id, newer.original_message.message_id);
    }
}
