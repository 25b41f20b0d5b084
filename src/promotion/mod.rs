//! Time-based priority promotion (spec.md §4.6).
//!
//! A message that has sat unprocessed past its priority's age threshold
//! gets bumped one level, same direction retries demote it the other way.
//! Thresholds default to the spec's constants (P3→P2 30s, P2→P1 15s,
//! P1→P0 5s) but are configurable per org, since spec.md leaves this open
//! as "a configuration affordance" rather than forbidding it (DESIGN.md).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::model::Priority;

#[derive(Debug, Clone, Deserialize)]
pub struct PromotionThresholds {
    pub p3_to_p2: Duration,
    pub p2_to_p1: Duration,
    pub p1_to_p0: Duration,
}

impl Default for PromotionThresholds {
    fn default() -> Self {
        Self {
            p3_to_p2: Duration::from_secs(30),
            p2_to_p1: Duration::from_secs(15),
            p1_to_p0: Duration::from_secs(5),
        }
    }
}

impl PromotionThresholds {
    fn threshold_for(&self, priority: Priority) -> Option<Duration> {
        match priority {
            Priority::P3 => Some(self.p3_to_p2),
            Priority::P2 => Some(self.p2_to_p1),
            Priority::P1 => Some(self.p1_to_p0),
            Priority::P0 => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromotionConfig {
    pub default_thresholds: PromotionThresholds,
    pub per_org_overrides: HashMap<String, PromotionThresholds>,
}

impl PromotionConfig {
    fn thresholds_for(&self, org_id: &str) -> &PromotionThresholds {
        self.per_org_overrides
            .get(org_id)
            .unwrap_or(&self.default_thresholds)
    }
}

/// Pure decision function: given how long a message has waited at its
/// current priority, should it be promoted? The scheduler that calls this
/// periodically against real queue ages lives in the worker/coordinator
/// binaries, not here, so this stays testable without a broker.
pub fn should_promote(config: &PromotionConfig, org_id: &str, priority: Priority, age: Duration) -> bool {
    match config.thresholds_for(org_id).threshold_for(priority) {
        Some(threshold) => age >= threshold,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p0_never_promotes_further() {
        let config = PromotionConfig::default();
        assert!(!should_promote(&config, "acme", Priority::P0, Duration::from_secs(9999)));
    }

    #[test]
    fn promotes_once_age_crosses_threshold() {
        let config = PromotionConfig::default();
        assert!(!should_promote(&config, "acme", Priority::P3, Duration::from_secs(29)));
        assert!(should_promote(&config, "acme", Priority::P3, Duration::from_secs(30)));
    }

    #[test]
    fn per_org_override_takes_precedence() {
        let mut config = PromotionConfig::default();
        config.per_org_overrides.insert(
            "acme".into(),
            PromotionThresholds {
                p3_to_p2: Duration::from_secs(5),
                ..PromotionThresholds::default()
            },
        );
        assert!(should_promote(&config, "acme", Priority::P3, Duration::from_secs(5)));
        assert!(!should_promote(&config, "other-org", Priority::P3, Duration::from_secs(5)));
    }
}
