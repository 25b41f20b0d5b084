//! Declares the broker topology: per-org priority exchanges/queues, a DLQ,
//! and the response exchange agent mailboxes bind to.
//!
//! Naming follows spec.md §6:
//! - exchange `agentqueue.{org_id}.requests` (topic), routing key
//!   `org.{org_id}.priority.{0..3}`, one durable queue per priority
//! - exchange `agentqueue.{org_id}.dlq` (fanout), one durable queue
//! - exchange `agentqueue.{org_id}.responses` (topic), routing key
//!   `org.{org_id}.agent.{agent_id}`, one durable queue per agent

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::Priority;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to connect to broker: {0}")]
    Connection(String),
    #[error("failed to declare topology: {0}")]
    Declare(String),
}

type Result<T> = std::result::Result<T, TopologyError>;

pub fn requests_exchange(org_id: &str) -> String {
    format!("agentqueue.{org_id}.requests")
}

pub fn priority_queue(org_id: &str, priority: Priority) -> String {
    format!("agentqueue.{org_id}.priority.{}", priority.as_u8())
}

pub fn priority_routing_key(org_id: &str, priority: Priority) -> String {
    format!("org.{org_id}.priority.{}", priority.as_u8())
}

pub fn dlq_exchange(org_id: &str) -> String {
    format!("agentqueue.{org_id}.dlq")
}

pub fn dlq_queue(org_id: &str) -> String {
    format!("agentqueue.{org_id}.dlq")
}

pub fn responses_exchange(org_id: &str) -> String {
    format!("agentqueue.{org_id}.responses")
}

pub fn agent_queue(org_id: &str, agent_id: &str) -> String {
    format!("agentqueue.{org_id}.agent.{agent_id}")
}

pub fn agent_routing_key(org_id: &str, agent_id: &str) -> String {
    format!("org.{org_id}.agent.{agent_id}")
}

/// Owns a pooled broker connection and declares topology idempotently.
pub struct TopologyManager {
    pool: Pool,
}

impl TopologyManager {
    /// Connect to the broker, retrying with exponential backoff+jitter.
    pub async fn connect(url: &str) -> Result<Self> {
        let manager = Manager::new(url.to_string(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| TopologyError::Connection(e.to_string()))?;

        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(10))
            .with_max_times(8)
            .with_jitter()
            .build();

        loop {
            match pool.get().await {
                Ok(_) => break,
                Err(e) => match backoff.next() {
                    Some(delay) => {
                        warn!(error = %e, "broker not reachable yet, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(TopologyError::Connection(e.to_string())),
                },
            }
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn channel(&self) -> Result<lapin::Channel> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e: PoolError| TopologyError::Connection(e.to_string()))?;
        conn.create_channel()
            .await
            .map_err(|e| TopologyError::Connection(e.to_string()))
    }

    /// Declare the full request/DLQ topology for an org: requests exchange,
    /// four priority queues, DLQ exchange and queue. Safe to call repeatedly.
    pub async fn ensure_org_topology(&self, org_id: &str) -> Result<()> {
        let channel = self.channel().await?;

        channel
            .exchange_declare(
                &requests_exchange(org_id),
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError::Declare(e.to_string()))?;

        for priority in Priority::ALL {
            let queue = priority_queue(org_id, priority);
            channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TopologyError::Declare(e.to_string()))?;

            channel
                .queue_bind(
                    &queue,
                    &requests_exchange(org_id),
                    &priority_routing_key(org_id, priority),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TopologyError::Declare(e.to_string()))?;
        }

        channel
            .exchange_declare(
                &dlq_exchange(org_id),
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError::Declare(e.to_string()))?;

        channel
            .queue_declare(
                &dlq_queue(org_id),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError::Declare(e.to_string()))?;

        channel
            .queue_bind(
                &dlq_queue(org_id),
                &dlq_exchange(org_id),
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError::Declare(e.to_string()))?;

        channel
            .exchange_declare(
                &responses_exchange(org_id),
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError::Declare(e.to_string()))?;

        info!(org_id, "org topology declared");
        Ok(())
    }

    /// Declare (or re-declare) the mailbox queue for one agent, bound to the
    /// org's response exchange.
    pub async fn ensure_agent_queue(&self, org_id: &str, agent_id: &str) -> Result<()> {
        let channel = self.channel().await?;
        let queue = agent_queue(org_id, agent_id);

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError::Declare(e.to_string()))?;

        channel
            .queue_bind(
                &queue,
                &responses_exchange(org_id),
                &agent_routing_key(org_id, agent_id),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError::Declare(e.to_string()))?;

        Ok(())
    }
}

/// Wraps a `TopologyManager` for callers that only need to share a pool.
pub fn shared_pool(manager: &TopologyManager) -> Arc<Pool> {
    Arc::new(manager.pool())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_matches_envelope_routing_key_scheme() {
        assert_eq!(priority_routing_key("acme", Priority::P0), "org.acme.priority.0");
        assert_eq!(priority_queue("acme", Priority::P3), "agentqueue.acme.priority.3");
        assert_eq!(agent_routing_key("acme", "agent-1"), "org.acme.agent.agent-1");
    }

    #[test]
    fn dlq_exchange_and_queue_share_a_name() {
        assert_eq!(dlq_exchange("acme"), dlq_queue("acme"));
    }
}

/// Run with: AMQP_URL=amqp://localhost:5672/%2f cargo test --features amqp -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use uuid::Uuid;

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string())
    }

    #[tokio::test]
    #[ignore = "requires a running broker"]
    async fn connect_and_declare_org_topology() {
        let org_id = format!("test-org-{}", Uuid::new_v4());
        let manager = TopologyManager::connect(&amqp_url()).await.expect("connect");
        manager.ensure_org_topology(&org_id).await.expect("declare topology");
        // idempotent: declaring twice must not error
        manager.ensure_org_topology(&org_id).await.expect("redeclare topology");
    }

    #[tokio::test]
    #[ignore = "requires a running broker"]
    async fn declare_agent_queue_binds_to_responses_exchange() {
        let org_id = format!("test-org-{}", Uuid::new_v4());
        let manager = TopologyManager::connect(&amqp_url()).await.expect("connect");
        manager.ensure_org_topology(&org_id).await.expect("declare topology");
        manager.ensure_agent_queue(&org_id, "agent-1").await.expect("declare agent queue");
    }
}
