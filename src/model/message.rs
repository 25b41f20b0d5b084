//! The `Message` request type (spec.md §3).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Priority;

/// Who originated a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatorKind {
    User,
    Agent,
    System,
}

/// `{kind, id}` pair identifying the originator of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedBy {
    pub kind: CreatorKind,
    pub id: String,
}

/// Request discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ModelCall,
    ToolCall,
    AgentMessage,
    MemorySave,
    MemoryRetrieve,
    MemoryUpdate,
    AgentSpawn,
    AgentTerminate,
}

/// Advisory resource limits a producer may attach to a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_duration_ms: Option<u64>,
    pub max_memory_bytes: Option<u64>,
}

/// A request flowing from a producer to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub org_id: String,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub goal_id: Uuid,
    pub task_id: Uuid,
    pub parent_message_id: Option<Uuid>,
    pub created_by: CreatedBy,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub schema_version: String,
    pub dedup_key: Option<String>,
    pub context: serde_json::Value,
    pub resource_limits: Option<ResourceLimits>,
    pub payload: serde_json::Value,
    /// When set, retries preserve priority instead of demoting (§4.3).
    #[serde(default)]
    pub no_demote: bool,
}

impl Message {
    /// Fill in `message_id`/`goal_id`/`task_id` if absent, as `Producer::publish` must.
    pub fn with_generated_ids(mut self) -> Self {
        if self.message_id.is_nil() {
            self.message_id = Uuid::new_v4();
        }
        if self.goal_id.is_nil() {
            self.goal_id = Uuid::new_v4();
        }
        if self.task_id.is_nil() {
            self.task_id = Uuid::new_v4();
        }
        self
    }

    /// Apply the demotion/retry-count bump a worker performs before requeuing (§4.3).
    pub fn demoted_for_retry(mut self) -> Self {
        self.retry_count += 1;
        if !self.no_demote {
            self.priority = self.priority.demoted();
        }
        self
    }

    /// Apply the aging-based promotion a `PromotionScheduler` performs (§4.6).
    pub fn promoted(mut self) -> Self {
        self.priority = self.priority.promoted();
        self
    }

    pub fn exhausted_retries(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}
