//! Reference CLI for publishing a single message. Useful for manual testing
//! and smoke checks; production producers are expected to embed
//! `agentqueue::producer::Producer` directly rather than shell out to this.

use std::process::ExitCode;
use std::sync::Arc;

use agentqueue::backpressure::{BackpressureConfig, BackpressureController, FixedDepthSampler};
use agentqueue::config::{init_tracing, Config};
use agentqueue::event_log::EventLogWriter;
use agentqueue::model::{CreatedBy, CreatorKind, Message, Priority};
use agentqueue::producer::Producer;
use agentqueue::store;
use agentqueue::topology::TopologyManager;
use clap::Parser;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "agentqueue-producer")]
struct Args {
    /// Tenant org id; falls back to ORG_ID if omitted.
    #[arg(long)]
    org_id: Option<String>,

    #[arg(long)]
    agent_id: Option<String>,

    #[arg(long)]
    user_id: Option<String>,

    /// One of model_call, tool_call, agent_message, memory_save,
    /// memory_retrieve, memory_update, agent_spawn, agent_terminate.
    #[arg(long)]
    message_type: String,

    /// 0 (highest) through 3 (lowest).
    #[arg(long, default_value_t = 2)]
    priority: u8,

    #[arg(long)]
    dedup_key: Option<String>,

    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    #[arg(long)]
    no_demote: bool,

    /// JSON payload body.
    #[arg(long, default_value = "{}")]
    payload: String,

    /// JSON context object.
    #[arg(long, default_value = "{}")]
    context: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(2);
        }
    };

    let Some(org_id) = args.org_id.clone().or_else(|| config.org_id.clone()) else {
        error!("org_id must be set via --org-id or ORG_ID");
        return ExitCode::from(2);
    };

    let message_type = match serde_json::from_value(serde_json::Value::String(args.message_type.clone())) {
        Ok(t) => t,
        Err(_) => {
            error!(message_type = %args.message_type, "unrecognized message type");
            return ExitCode::from(2);
        }
    };
    let Some(priority) = Priority::from_u8(args.priority) else {
        error!(priority = args.priority, "priority must be 0..=3");
        return ExitCode::from(2);
    };
    let payload: serde_json::Value = match serde_json::from_str(&args.payload) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "payload is not valid JSON");
            return ExitCode::from(2);
        }
    };
    let context: serde_json::Value = match serde_json::from_str(&args.context) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "context is not valid JSON");
            return ExitCode::from(2);
        }
    };

    let topology = match TopologyManager::connect(&config.broker_url).await {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "broker unavailable");
            return ExitCode::from(3);
        }
    };

    let store = match store::from_config(&config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "event store unavailable");
            return ExitCode::from(4);
        }
    };

    let backpressure = Arc::new(BackpressureController::new(
        BackpressureConfig::default(),
        Arc::new(FixedDepthSampler::new()),
    ));
    let event_log = EventLogWriter::spawn(store.clone());
    let producer = Producer::new(topology.pool(), store, backpressure, event_log);

    let message = Message {
        message_id: Uuid::nil(),
        org_id: org_id.clone(),
        agent_id: args.agent_id,
        user_id: args.user_id,
        goal_id: Uuid::nil(),
        task_id: Uuid::nil(),
        parent_message_id: None,
        created_by: CreatedBy {
            kind: CreatorKind::User,
            id: "agentqueue-producer-cli".to_string(),
        },
        message_type,
        priority,
        created_at: chrono::Utc::now(),
        expires_at: None,
        retry_count: 0,
        max_retries: args.max_retries,
        schema_version: format!("{}.0.0", agentqueue::validation::CURRENT_SCHEMA_MAJOR),
        dedup_key: args.dedup_key,
        context,
        resource_limits: None,
        payload,
        no_demote: args.no_demote,
    }
    .with_generated_ids();

    let message_id = message.message_id;
    match producer.publish(message).await {
        Ok(true) => {
            info!(%org_id, %message_id, "message accepted");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            info!(%org_id, %message_id, "duplicate dedup_key, message dropped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, %org_id, "publish failed");
            ExitCode::from(1)
        }
    }
}
