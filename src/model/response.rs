//! The `Response` type a worker emits back through the coordinator (spec.md §3).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Result,
    StreamChunk,
    StreamComplete,
    Error,
    Progress,
    Acknowledgment,
}

/// Structured error payload carried by an `Error` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub detail: String,
    pub retriable: bool,
}

/// A response flowing from a worker back to the originating agent via the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: Uuid,
    #[serde(rename = "type")]
    pub response_type: ResponseType,
    pub agent_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub chunk: Option<serde_json::Value>,
    #[serde(default)]
    pub chunk_index: Option<u32>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    #[serde(default)]
    pub percent: Option<u8>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
}

impl Response {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.response_type,
            ResponseType::Result | ResponseType::StreamComplete | ResponseType::Error
        )
    }

    pub fn error(request_id: Uuid, agent_id: impl Into<String>, detail: ErrorDetail) -> Self {
        Response {
            request_id,
            response_type: ResponseType::Error,
            agent_id: agent_id.into(),
            timestamp: chrono::Utc::now(),
            chunk: None,
            chunk_index: None,
            data: None,
            error: Some(detail),
            percent: None,
            note: None,
            stage: None,
        }
    }
}
