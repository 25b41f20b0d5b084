//! `MessageEnvelope` — the JSON shape that actually transits the broker (spec.md §6).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Message, Priority};

/// Headers stamped onto a `Message` when it is wrapped for transit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    pub message_id: Uuid,
    pub org_id: String,
    pub agent_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    pub priority: Priority,
    pub retry_count: u32,
    pub schema_version: String,
    pub dedup_key: Option<String>,
}

/// The envelope published to and consumed from the broker: headers plus the
/// original message body, so a consumer can route on headers without
/// deserializing the body first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub headers: EnvelopeHeaders,
    pub body: Message,
}

impl Envelope {
    pub fn wrap(message: Message) -> Self {
        let headers = EnvelopeHeaders {
            message_id: message.message_id,
            org_id: message.org_id.clone(),
            agent_id: message.agent_id.clone(),
            message_type: serde_json::to_value(message.message_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default(),
            priority: message.priority,
            retry_count: message.retry_count,
            schema_version: message.schema_version.clone(),
            dedup_key: message.dedup_key.clone(),
        };
        Envelope {
            headers,
            body: message,
        }
    }

    pub fn into_message(self) -> Message {
        self.body
    }

    pub fn routing_key(&self) -> String {
        format!(
            "org.{}.priority.{}",
            self.headers.org_id,
            self.headers.priority.as_u8()
        )
    }
}
