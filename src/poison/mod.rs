//! Poison-message quarantine: a message that crashes a worker process
//! repeatedly (not just fails cleanly) gets pulled out of circulation before
//! it can take down the whole worker fleet.
//!
//! Like `idempotency`, this keeps no local state — the counter lives in the
//! event store so quarantine decisions are consistent across worker
//! instances (spec.md §9).

use std::sync::Arc;

use crate::model::IdempotencyKey;
use crate::store::{EventStore, Result};

pub struct PoisonTracker {
    store: Arc<dyn EventStore>,
    threshold: u32,
}

impl PoisonTracker {
    pub fn new(store: Arc<dyn EventStore>, threshold: u32) -> Self {
        Self { store, threshold }
    }

    /// Record a crash for `dedup_key` and report whether it has now crossed
    /// the quarantine threshold. Messages with no `dedup_key` can't be
    /// tracked individually and are never quarantined this way.
    pub async fn record_crash(&self, org_id: &str, dedup_key: Option<&str>) -> Result<bool> {
        let Some(dedup_key) = dedup_key else {
            return Ok(false);
        };
        let key = IdempotencyKey {
            org_id: org_id.to_string(),
            dedup_key: dedup_key.to_string(),
        };
        let count = self.store.increment_poison_counter(&key).await?;
        Ok(count >= self.threshold)
    }

    /// Read-only check for whether `dedup_key` is already over the
    /// quarantine threshold, without bumping the counter. Used to gate
    /// handler invocation on redelivery of a message that was already
    /// quarantined before this delivery attempt.
    pub async fn is_quarantined(&self, org_id: &str, dedup_key: Option<&str>) -> Result<bool> {
        let Some(dedup_key) = dedup_key else {
            return Ok(false);
        };
        let key = IdempotencyKey {
            org_id: org_id.to_string(),
            dedup_key: dedup_key.to_string(),
        };
        let count = self.store.get_poison_counter(&key).await?;
        Ok(count >= self.threshold)
    }

    pub async fn clear(&self, org_id: &str, dedup_key: &str) -> Result<()> {
        let key = IdempotencyKey {
            org_id: org_id.to_string(),
            dedup_key: dedup_key.to_string(),
        };
        self.store.reset_poison_counter(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventStore;

    #[tokio::test]
    async fn quarantines_after_threshold_crashes() {
        let tracker = PoisonTracker::new(Arc::new(InMemoryEventStore::new()), 3);
        assert!(!tracker.record_crash("acme", Some("k1")).await.unwrap());
        assert!(!tracker.record_crash("acme", Some("k1")).await.unwrap());
        assert!(tracker.record_crash("acme", Some("k1")).await.unwrap());
    }

    #[tokio::test]
    async fn untracked_messages_never_quarantined() {
        let tracker = PoisonTracker::new(Arc::new(InMemoryEventStore::new()), 1);
        assert!(!tracker.record_crash("acme", None).await.unwrap());
    }

    #[tokio::test]
    async fn is_quarantined_does_not_mutate_the_counter() {
        let tracker = PoisonTracker::new(Arc::new(InMemoryEventStore::new()), 2);
        assert!(!tracker.is_quarantined("acme", Some("k1")).await.unwrap());
        assert!(!tracker.record_crash("acme", Some("k1")).await.unwrap());
        assert!(tracker.record_crash("acme", Some("k1")).await.unwrap());
        assert!(tracker.is_quarantined("acme", Some("k1")).await.unwrap());
        assert!(tracker.is_quarantined("acme", Some("k1")).await.unwrap());
    }

    #[tokio::test]
    async fn clear_resets_the_counter() {
        let store = Arc::new(InMemoryEventStore::new());
        let tracker = PoisonTracker::new(store, 2);
        assert!(!tracker.record_crash("acme", Some("k1")).await.unwrap());
        tracker.clear("acme", "k1").await.unwrap();
        assert!(!tracker.record_crash("acme", Some("k1")).await.unwrap());
    }
}
