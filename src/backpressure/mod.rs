//! Tiered, queue-depth-based admission control (spec.md §4.7).
//!
//! Samples the depth of an org's priority queues and throttles or rejects
//! new publishes once depth crosses configured watermarks. No broker
//! integration lives here — `sample_depth` is pluggable so the producer can
//! be tested without a live broker, and a real deployment wires it to the
//! topology manager's queue inspection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureDecision {
    Admit,
    Reject,
}

/// Depth watermarks for one org. Crossing `throttle_at` logs a warning but
/// still admits; crossing `reject_at` rejects new publishes outright.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub throttle_at: u64,
    pub reject_at: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            throttle_at: 10_000,
            reject_at: 50_000,
        }
    }
}

/// Source of truth for current queue depth. In production this samples the
/// broker's queue-declare passive response; tests can supply a fixed depth.
#[async_trait]
pub trait DepthSampler: Send + Sync {
    async fn depth(&self, org_id: &str) -> u64;
}

pub struct FixedDepthSampler {
    depths: RwLock<HashMap<String, u64>>,
}

impl FixedDepthSampler {
    pub fn new() -> Self {
        Self {
            depths: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set(&self, org_id: &str, depth: u64) {
        self.depths.write().await.insert(org_id.to_string(), depth);
    }
}

impl Default for FixedDepthSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DepthSampler for FixedDepthSampler {
    async fn depth(&self, org_id: &str) -> u64 {
        *self.depths.read().await.get(org_id).unwrap_or(&0)
    }
}

pub struct BackpressureController {
    config: BackpressureConfig,
    sampler: Arc<dyn DepthSampler>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig, sampler: Arc<dyn DepthSampler>) -> Self {
        Self { config, sampler }
    }

    pub async fn admit(&self, org_id: &str) -> BackpressureDecision {
        let depth = self.sampler.depth(org_id).await;
        if depth >= self.config.reject_at {
            warn!(org_id, depth, "rejecting publish, queue depth over limit");
            BackpressureDecision::Reject
        } else {
            if depth >= self.config.throttle_at {
                warn!(org_id, depth, "queue depth over throttle watermark");
            }
            BackpressureDecision::Admit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_below_throttle() {
        let sampler = Arc::new(FixedDepthSampler::new());
        sampler.set("acme", 100).await;
        let controller = BackpressureController::new(BackpressureConfig::default(), sampler);
        assert_eq!(controller.admit("acme").await, BackpressureDecision::Admit);
    }

    #[tokio::test]
    async fn still_admits_between_throttle_and_reject() {
        let sampler = Arc::new(FixedDepthSampler::new());
        sampler.set("acme", 20_000).await;
        let controller = BackpressureController::new(BackpressureConfig::default(), sampler);
        assert_eq!(controller.admit("acme").await, BackpressureDecision::Admit);
    }

    #[tokio::test]
    async fn rejects_at_or_above_reject_watermark() {
        let sampler = Arc::new(FixedDepthSampler::new());
        sampler.set("acme", 50_000).await;
        let controller = BackpressureController::new(BackpressureConfig::default(), sampler);
        assert_eq!(controller.admit("acme").await, BackpressureDecision::Reject);
    }

    #[tokio::test]
    async fn orgs_are_tracked_independently() {
        let sampler = Arc::new(FixedDepthSampler::new());
        sampler.set("acme", 60_000).await;
        let controller = BackpressureController::new(BackpressureConfig::default(), sampler);
        assert_eq!(controller.admit("other-org").await, BackpressureDecision::Admit);
    }
}
