//! Idempotency gate: one `(org_id, dedup_key)` is allowed through exactly once.
//!
//! Per spec.md §9 this deliberately has no in-memory cache of its own — the
//! event store's `claim_idempotency_key` is the single arbiter, so two
//! producer instances racing on the same dedup key still agree on exactly
//! one winner.

use std::sync::Arc;

use crate::model::IdempotencyKey;
use crate::store::{EventStore, Result};

pub struct IdempotencyGate {
    store: Arc<dyn EventStore>,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Returns `true` if this is the first time `key` has been seen, i.e.
    /// the caller should proceed with publishing. A message with no
    /// `dedup_key` always passes through (idempotency is opt-in per §3).
    pub async fn admit(&self, org_id: &str, dedup_key: Option<&str>) -> Result<bool> {
        let Some(dedup_key) = dedup_key else {
            return Ok(true);
        };
        let key = IdempotencyKey {
            org_id: org_id.to_string(),
            dedup_key: dedup_key.to_string(),
        };
        self.store.claim_idempotency_key(&key).await
    }

    /// Release a previously claimed dedup key, e.g. because the publish that
    /// claimed it never reached the broker. Without this a transient broker
    /// outage would permanently burn the key and the caller could never
    /// retry the same logical message under it.
    pub async fn release(&self, org_id: &str, dedup_key: &str) -> Result<()> {
        let key = IdempotencyKey {
            org_id: org_id.to_string(),
            dedup_key: dedup_key.to_string(),
        };
        self.store.release_idempotency_key(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventStore;

    #[tokio::test]
    async fn messages_without_dedup_key_always_admitted() {
        let gate = IdempotencyGate::new(Arc::new(InMemoryEventStore::new()));
        assert!(gate.admit("acme", None).await.unwrap());
        assert!(gate.admit("acme", None).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_dedup_key_admitted_once() {
        let gate = IdempotencyGate::new(Arc::new(InMemoryEventStore::new()));
        assert!(gate.admit("acme", Some("k1")).await.unwrap());
        assert!(!gate.admit("acme", Some("k1")).await.unwrap());
    }

    #[tokio::test]
    async fn dedup_keys_are_scoped_per_org() {
        let gate = IdempotencyGate::new(Arc::new(InMemoryEventStore::new()));
        assert!(gate.admit("acme", Some("k1")).await.unwrap());
        assert!(gate.admit("other-org", Some("k1")).await.unwrap());
    }
}
