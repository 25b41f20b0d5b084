//! Input validation for messages crossing the producer boundary.
//!
//! Centralizes the field rules spec.md pins down for `Message`: org/dedup key
//! shape, schema version window, and advisory resource limits. Everything
//! here runs before a message is handed to the idempotency gate or published.

use thiserror::Error;

use crate::model::{Message, ResourceLimits};

/// Length and numeric limits for validated fields.
pub mod limits {
    pub const MAX_ORG_ID_LENGTH: usize = 64;
    pub const MAX_DEDUP_KEY_LENGTH: usize = 256;
    pub const MAX_PAYLOAD_BYTES: usize = 1_000_000;
    pub const MAX_MEMORY_BYTES: u64 = 8 * 1024 * 1024 * 1024;
}

/// Current schema major version this crate understands. Messages stamped
/// with a major version more than one behind this are rejected outright
/// (spec.md §3/§7 — "schema translation beyond a two-major-version window"
/// is a named Non-goal, so no migration path exists for older majors).
pub const CURRENT_SCHEMA_MAJOR: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("org_id cannot be empty")]
    OrgIdEmpty,
    #[error("org_id exceeds maximum length (max: {max}, got: {got})")]
    OrgIdTooLong { max: usize, got: usize },
    #[error("org_id contains invalid characters (allowed: a-z, 0-9, _, -)")]
    OrgIdInvalidChars,
    #[error("dedup_key exceeds maximum length (max: {max}, got: {got})")]
    DedupKeyTooLong { max: usize, got: usize },
    #[error("schema_version is not a valid semantic version: {0}")]
    SchemaVersionMalformed(String),
    #[error("schema_version major {got} is outside the supported window (current: {current})")]
    SchemaVersionOutOfWindow { current: u32, got: u32 },
    #[error("payload exceeds maximum size (max: {max}, got: {got})")]
    PayloadTooLarge { max: usize, got: usize },
    #[error("resource_limits.max_memory_bytes exceeds maximum (max: {max}, got: {got})")]
    MemoryLimitTooLarge { max: u64, got: u64 },
    #[error("max_retries cannot be zero when retry_count is nonzero")]
    RetryBudgetInconsistent,
}

/// Validate an org identifier: non-empty, bounded length, `[a-z0-9_-]+`.
pub fn validate_org_id(org_id: &str) -> Result<(), ValidationError> {
    if org_id.is_empty() {
        return Err(ValidationError::OrgIdEmpty);
    }
    if org_id.len() > limits::MAX_ORG_ID_LENGTH {
        return Err(ValidationError::OrgIdTooLong {
            max: limits::MAX_ORG_ID_LENGTH,
            got: org_id.len(),
        });
    }
    if !org_id
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
    {
        return Err(ValidationError::OrgIdInvalidChars);
    }
    Ok(())
}

/// Validate an optional dedup key: bounded length if present.
pub fn validate_dedup_key(dedup_key: Option<&str>) -> Result<(), ValidationError> {
    if let Some(key) = dedup_key {
        if key.len() > limits::MAX_DEDUP_KEY_LENGTH {
            return Err(ValidationError::DedupKeyTooLong {
                max: limits::MAX_DEDUP_KEY_LENGTH,
                got: key.len(),
            });
        }
    }
    Ok(())
}

/// Parse the leading `major` component out of a `major.minor.patch` string.
fn parse_major(schema_version: &str) -> Result<u32, ValidationError> {
    schema_version
        .split('.')
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| ValidationError::SchemaVersionMalformed(schema_version.to_string()))
}

/// Validate that `schema_version`'s major falls within the current or
/// immediately previous major (the supported migration window).
pub fn validate_schema_version(schema_version: &str) -> Result<(), ValidationError> {
    let major = parse_major(schema_version)?;
    let floor = CURRENT_SCHEMA_MAJOR.saturating_sub(1);
    if major < floor || major > CURRENT_SCHEMA_MAJOR {
        return Err(ValidationError::SchemaVersionOutOfWindow {
            current: CURRENT_SCHEMA_MAJOR,
            got: major,
        });
    }
    Ok(())
}

/// Validate advisory resource limits, if present.
pub fn validate_resource_limits(limits: &ResourceLimits) -> Result<(), ValidationError> {
    if let Some(bytes) = limits.max_memory_bytes {
        if bytes > limits::MAX_MEMORY_BYTES {
            return Err(ValidationError::MemoryLimitTooLarge {
                max: limits::MAX_MEMORY_BYTES,
                got: bytes,
            });
        }
    }
    Ok(())
}

/// Run every rule against a fully-populated `Message`, short-circuiting on
/// the first failure (mirrors the order a producer would want to fail
/// fast: cheap string checks before the payload size scan).
pub fn validate_message(message: &Message) -> Result<(), ValidationError> {
    validate_org_id(&message.org_id)?;
    validate_dedup_key(message.dedup_key.as_deref())?;
    validate_schema_version(&message.schema_version)?;

    if let Some(limits) = &message.resource_limits {
        validate_resource_limits(limits)?;
    }

    let payload_bytes = serde_json::to_vec(&message.payload)
        .map(|v| v.len())
        .unwrap_or(0);
    if payload_bytes > limits::MAX_PAYLOAD_BYTES {
        return Err(ValidationError::PayloadTooLarge {
            max: limits::MAX_PAYLOAD_BYTES,
            got: payload_bytes,
        });
    }

    if message.max_retries == 0 && message.retry_count > 0 {
        return Err(ValidationError::RetryBudgetInconsistent);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CreatedBy, CreatorKind, MessageType, Priority};
    use uuid::Uuid;

    fn base_message() -> Message {
        Message {
            message_id: Uuid::new_v4(),
            org_id: "acme".into(),
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
            schema_version: "1.2.0".into(),
            dedup_key: Some("k1".into()),
            context: serde_json::Value::Null,
            resource_limits: None,
            payload: serde_json::json!({"hello": "world"}),
            no_demote: false,
        }
    }

    #[test]
    fn valid_message_passes() {
        assert!(validate_message(&base_message()).is_ok());
    }

    #[test]
    fn empty_org_id_rejected() {
        let mut msg = base_message();
        msg.org_id = String::new();
        assert_eq!(validate_message(&msg), Err(ValidationError::OrgIdEmpty));
    }

    #[test]
    fn org_id_with_uppercase_rejected() {
        let mut msg = base_message();
        msg.org_id = "ACME".into();
        assert_eq!(
            validate_message(&msg),
            Err(ValidationError::OrgIdInvalidChars)
        );
    }

    #[test]
    fn schema_version_same_major_ok() {
        assert!(validate_schema_version("1.9.9").is_ok());
    }

    #[test]
    fn schema_version_previous_major_ok() {
        assert!(validate_schema_version("0.4.0").is_ok());
    }

    #[test]
    fn schema_version_two_majors_back_rejected() {
        let err = validate_schema_version("5.0.0").unwrap_err();
        assert!(matches!(
            err,
            ValidationError::SchemaVersionOutOfWindow { .. }
        ));
    }

    #[test]
    fn malformed_schema_version_rejected() {
        let err = validate_schema_version("not-a-version").unwrap_err();
        assert!(matches!(err, ValidationError::SchemaVersionMalformed(_)));
    }

    #[test]
    fn oversized_memory_limit_rejected() {
        let limits = ResourceLimits {
            max_duration_ms: None,
            max_memory_bytes: Some(limits::MAX_MEMORY_BYTES + 1),
        };
        assert!(matches!(
            validate_resource_limits(&limits),
            Err(ValidationError::MemoryLimitTooLarge { .. })
        ));
    }

    #[test]
    fn retry_budget_inconsistency_rejected() {
        let mut msg = base_message();
        msg.max_retries = 0;
        msg.retry_count = 1;
        assert_eq!(
            validate_message(&msg),
            Err(ValidationError::RetryBudgetInconsistent)
        );
    }
}
