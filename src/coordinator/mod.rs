//! Per-server coordinator: owns one broker connection, demultiplexes
//! responses off the org's response exchange into bounded per-agent
//! mailboxes (spec.md §4.4).
//!
//! Generalizes the teacher's "list of handlers, fan every event out to all
//! of them" shape into "one handler (mailbox) per `agent_id`" — a response
//! bears exactly one agent's id, so it's routed, not broadcast.
//!
//! The mailbox itself is a bounded `VecDeque` rather than an `mpsc` channel
//! because the `drop_oldest_non_p0` overflow policy needs to inspect and
//! evict an arbitrary queued item, which `mpsc::Sender` can't do.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{error, warn};

use crate::dlq::DeadLetterPublisher;
use crate::model::{DlqReason, DlqRecord, Priority, Response};
use crate::store::EventStore;
use crate::topology::agent_queue;

const MAILBOX_CAPACITY: usize = 256;
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(120);

/// How a mailbox sheds load once it's full. spec.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxOverflowPolicy {
    /// Back-pressure the consumer: hold the response until a slot frees.
    Block,
    /// Evict the oldest non-P0 entry to make room; P0 entries are never
    /// evicted, so a mailbox full of only P0 responses falls back to
    /// blocking rather than silently dropping one.
    DropOldestNonP0,
}

impl Default for MailboxOverflowPolicy {
    fn default() -> Self {
        MailboxOverflowPolicy::Block
    }
}

pub struct CoordinatorConfig {
    pub mailbox_capacity: usize,
    pub overflow_policy: MailboxOverflowPolicy,
    pub liveness_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: MAILBOX_CAPACITY,
            overflow_policy: MailboxOverflowPolicy::Block,
            liveness_timeout: LIVENESS_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("pool error: {0}")]
    Pool(String),
    #[error("no mailbox registered for agent {0}")]
    UnknownAgent(String),
}

enum PushOutcome {
    Delivered,
    /// The mailbox was full and the oldest non-P0 entry was evicted to
    /// admit this one.
    DroppedOldest,
    /// The mailbox was full of P0 entries and this response wasn't P0, so
    /// it was rejected outright rather than displacing a P0 response.
    Rejected,
    /// The mailbox was already closed (agent deregistered concurrently).
    Closed,
}

/// A single agent's bounded response queue.
struct Mailbox {
    queue: Mutex<VecDeque<(Priority, Response)>>,
    capacity: usize,
    policy: MailboxOverflowPolicy,
    item_ready: Notify,
    space_ready: Notify,
    closed: AtomicBool,
}

impl Mailbox {
    fn new(capacity: usize, policy: MailboxOverflowPolicy) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            policy,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    async fn push(&self, priority: Priority, response: Response) -> PushOutcome {
        loop {
            {
                let mut queue = self.queue.lock().await;
                if self.closed.load(Ordering::Acquire) {
                    return PushOutcome::Closed;
                }
                if queue.len() < self.capacity {
                    queue.push_back((priority, response));
                    self.item_ready.notify_one();
                    return PushOutcome::Delivered;
                }
                if self.policy == MailboxOverflowPolicy::DropOldestNonP0 {
                    if let Some(pos) = queue.iter().position(|(p, _)| *p != Priority::P0) {
                        queue.remove(pos);
                        queue.push_back((priority, response));
                        self.item_ready.notify_one();
                        return PushOutcome::DroppedOldest;
                    }
                    if priority != Priority::P0 {
                        return PushOutcome::Rejected;
                    }
                    // Mailbox is full of P0 entries and this is also P0:
                    // nothing evictable, so fall through and block.
                }
            }
            self.space_ready.notified().await;
        }
    }

    async fn recv(&self) -> Option<Response> {
        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some((_, response)) = queue.pop_front() {
                    self.space_ready.notify_one();
                    return Some(response);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.item_ready.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.item_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    async fn drain(&self) -> Vec<Response> {
        self.queue.lock().await.drain(..).map(|(_, r)| r).collect()
    }
}

/// Handed back by `register_agent`; the transport-facing half of a mailbox.
pub struct MailboxReceiver {
    mailbox: Arc<Mailbox>,
}

impl MailboxReceiver {
    pub async fn recv(&self) -> Option<Response> {
        self.mailbox.recv().await
    }
}

/// Registry of per-agent mailboxes plus the consume loop that fills them.
pub struct Coordinator {
    pool: deadpool_lapin::Pool,
    org_id: String,
    store: Arc<dyn EventStore>,
    dlq: Arc<dyn DeadLetterPublisher>,
    mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
    heartbeats: RwLock<HashMap<String, Instant>>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        pool: deadpool_lapin::Pool,
        org_id: impl Into<String>,
        store: Arc<dyn EventStore>,
        dlq: Arc<dyn DeadLetterPublisher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            pool,
            org_id: org_id.into(),
            store,
            dlq,
            mailboxes: RwLock::new(HashMap::new()),
            heartbeats: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register an agent and get back the receiving end of its mailbox.
    /// Re-registering replaces the previous mailbox (e.g. after a
    /// reconnect), matching the "agent connects, coordinator opens a fresh
    /// channel" lifecycle spec.md §4.4 describes.
    pub async fn register_agent(&self, agent_id: &str) -> MailboxReceiver {
        let mailbox = Mailbox::new(self.config.mailbox_capacity, self.config.overflow_policy);
        self.mailboxes.write().await.insert(agent_id.to_string(), mailbox.clone());
        self.heartbeats.write().await.insert(agent_id.to_string(), Instant::now());
        MailboxReceiver { mailbox }
    }

    /// Deregister an agent. Anything still sitting in its mailbox can no
    /// longer be delivered, so it's dead-lettered with `agent_unreachable`
    /// rather than silently discarded (spec.md §4.4's in-flight-stream
    /// boundary).
    pub async fn deregister_agent(&self, agent_id: &str) {
        let mailbox = self.mailboxes.write().await.remove(agent_id);
        self.heartbeats.write().await.remove(agent_id);
        if let Some(mailbox) = mailbox {
            mailbox.close();
            for response in mailbox.drain().await {
                self.dead_letter_response(agent_id, response, DlqReason::AgentUnreachable).await;
            }
        }
    }

    pub async fn agent_count(&self) -> usize {
        self.mailboxes.read().await.len()
    }

    /// Scan for agents that haven't had a delivery (or explicit heartbeat)
    /// within the configured liveness timeout, and drain their mailboxes to
    /// the DLQ with `agent_runaway` rather than let the backlog grow
    /// unbounded behind an agent that's stopped reading.
    pub async fn reap_unresponsive_agents(&self) {
        let now = Instant::now();
        let stale: Vec<String> = self
            .heartbeats
            .read()
            .await
            .iter()
            .filter(|(_, last_seen)| now.duration_since(**last_seen) > self.config.liveness_timeout)
            .map(|(agent_id, _)| agent_id.clone())
            .collect();

        for agent_id in stale {
            warn!(agent_id, "agent exceeded liveness timeout, draining mailbox to dlq");
            let mailbox = self.mailboxes.write().await.remove(&agent_id);
            self.heartbeats.write().await.remove(&agent_id);
            if let Some(mailbox) = mailbox {
                mailbox.close();
                for response in mailbox.drain().await {
                    self.dead_letter_response(&agent_id, response, DlqReason::AgentRunaway).await;
                }
            }
        }
    }

    /// Run `reap_unresponsive_agents` on a fixed interval until cancelled.
    pub async fn run_liveness_monitor(&self, check_interval: Duration) {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            ticker.tick().await;
            self.reap_unresponsive_agents().await;
        }
    }

    /// Consume the response queue for one agent and deliver into its
    /// mailbox until the connection drops. One task per agent, all sharing
    /// this coordinator's connection pool.
    pub async fn run_agent_consumer(&self, agent_id: &str) -> Result<(), CoordinatorError> {
        let conn = self.pool.get().await.map_err(|e| CoordinatorError::Pool(e.to_string()))?;
        let channel = conn.create_channel().await?;
        let queue = agent_queue(&self.org_id, agent_id);

        let mut consumer = channel
            .basic_consume(
                &queue,
                &format!("agentqueue-coordinator-{agent_id}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(e) => {
                    error!(error = %e, agent_id, "coordinator consumer error, reconnecting");
                    break;
                }
            };

            match serde_json::from_slice::<Response>(&delivery.data) {
                Ok(response) => {
                    self.heartbeat(agent_id).await;
                    match self.deliver(agent_id, response).await {
                        PushOutcome::Delivered | PushOutcome::DroppedOldest => {
                            let _ = delivery.ack(BasicAckOptions::default()).await;
                        }
                        PushOutcome::Rejected | PushOutcome::Closed => {
                            warn!(agent_id, "mailbox unavailable for agent, requeueing response");
                            let _ =
                                delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to decode response, rejecting without requeue");
                    let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                }
            }
        }

        Ok(())
    }

    /// Mark `agent_id` alive. Called on every delivered response; embedders
    /// with a separate transport-level heartbeat (e.g. a websocket ping)
    /// can call this directly too.
    pub async fn heartbeat(&self, agent_id: &str) {
        self.heartbeats.write().await.insert(agent_id.to_string(), Instant::now());
    }

    async fn deliver(&self, agent_id: &str, response: Response) -> PushOutcome {
        let priority = match self.store.get_message(&self.org_id, response.request_id).await {
            Ok(Some(message)) => message.priority,
            _ => Priority::default(),
        };

        let mailboxes = self.mailboxes.read().await;
        let Some(mailbox) = mailboxes.get(agent_id).cloned() else {
            return PushOutcome::Closed;
        };
        drop(mailboxes);

        mailbox.push(priority, response).await
    }

    async fn dead_letter_response(&self, agent_id: &str, response: Response, reason: DlqReason) {
        match self.store.get_message(&self.org_id, response.request_id).await {
            Ok(Some(message)) => {
                let record = DlqRecord {
                    org_id: self.org_id.clone(),
                    original_message: message,
                    error_history: vec![],
                    can_replay: true,
                    dlq_timestamp: chrono::Utc::now(),
                    reason,
                };
                if let Err(e) = self.dlq.publish(record).await {
                    error!(error = %e, agent_id, "failed to dead-letter orphaned response");
                }
            }
            Ok(None) => {
                warn!(agent_id, request_id = %response.request_id, "no stored message for orphaned response, dropping");
            }
            Err(e) => {
                error!(error = %e, agent_id, "failed to look up original message for orphaned response");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::NoopDeadLetterPublisher;
    use crate::store::InMemoryEventStore;
    use uuid::Uuid;

    fn sample_response(agent_id: &str) -> Response {
        Response {
            request_id: Uuid::new_v4(),
            response_type: crate::model::ResponseType::Result,
            agent_id: agent_id.to_string(),
            timestamp: chrono::Utc::now(),
            chunk: None,
            chunk_index: None,
            data: Some(serde_json::json!({"ok": true})),
            error: None,
            percent: None,
            note: None,
            stage: None,
        }
    }

    fn test_coordinator() -> Coordinator {
        Coordinator::new(
            test_pool(),
            "acme",
            Arc::new(InMemoryEventStore::new()),
            Arc::new(NoopDeadLetterPublisher),
            CoordinatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn deliver_to_registered_agent_succeeds() {
        let coordinator = test_coordinator();
        let mailbox = coordinator.register_agent("agent-1").await;

        assert!(matches!(
            coordinator.deliver("agent-1", sample_response("agent-1")).await,
            PushOutcome::Delivered
        ));
        let received = mailbox.recv().await.unwrap();
        assert_eq!(received.agent_id, "agent-1");
    }

    #[tokio::test]
    async fn deliver_to_unregistered_agent_fails() {
        let coordinator = test_coordinator();
        assert!(matches!(
            coordinator.deliver("ghost", sample_response("ghost")).await,
            PushOutcome::Closed
        ));
    }

    #[tokio::test]
    async fn deregister_removes_the_mailbox() {
        let coordinator = test_coordinator();
        let _mailbox = coordinator.register_agent("agent-1").await;
        assert_eq!(coordinator.agent_count().await, 1);
        coordinator.deregister_agent("agent-1").await;
        assert_eq!(coordinator.agent_count().await, 0);
    }

    #[tokio::test]
    async fn drop_oldest_non_p0_evicts_the_oldest_low_priority_entry() {
        let mailbox = Mailbox::new(2, MailboxOverflowPolicy::DropOldestNonP0);
        assert!(matches!(
            mailbox.push(Priority::P2, sample_response("a")).await,
            PushOutcome::Delivered
        ));
        assert!(matches!(
            mailbox.push(Priority::P3, sample_response("a")).await,
            PushOutcome::Delivered
        ));
        // Full; the oldest (P2) entry should be evicted to admit this one.
        assert!(matches!(
            mailbox.push(Priority::P1, sample_response("a")).await,
            PushOutcome::DroppedOldest
        ));
        let remaining: Vec<_> = mailbox.drain().await;
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn drop_oldest_non_p0_rejects_non_p0_when_mailbox_is_all_p0() {
        let mailbox = Mailbox::new(1, MailboxOverflowPolicy::DropOldestNonP0);
        assert!(matches!(
            mailbox.push(Priority::P0, sample_response("a")).await,
            PushOutcome::Delivered
        ));
        assert!(matches!(
            mailbox.push(Priority::P1, sample_response("a")).await,
            PushOutcome::Rejected
        ));
    }

    #[tokio::test]
    async fn deregister_drains_pending_responses_without_panicking() {
        let coordinator = test_coordinator();
        let _mailbox = coordinator.register_agent("agent-1").await;
        coordinator.deliver("agent-1", sample_response("agent-1")).await;
        coordinator.deregister_agent("agent-1").await;
        assert_eq!(coordinator.agent_count().await, 0);
    }

    #[tokio::test]
    async fn reap_unresponsive_agents_removes_stale_heartbeats() {
        let coordinator = test_coordinator();
        let _mailbox = coordinator.register_agent("agent-1").await;
        coordinator.heartbeats.write().await.insert(
            "agent-1".to_string(),
            Instant::now() - Duration::from_secs(1000),
        );
        coordinator.reap_unresponsive_agents().await;
        assert_eq!(coordinator.agent_count().await, 0);
    }

    /// A pool that is never actually connected to; fine for tests that only
    /// exercise mailbox registration/delivery, not `run_agent_consumer`.
    fn test_pool() -> deadpool_lapin::Pool {
        let manager = deadpool_lapin::Manager::new("amqp://127.0.0.1:5672/%2f", Default::default());
        deadpool_lapin::Pool::builder(manager).max_size(1).build().unwrap()
    }
}
