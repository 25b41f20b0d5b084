//! Replay dead-lettered messages: lists `can_replay` records for an org and
//! re-publishes each through a fresh `Producer`, unless `--dry-run`.

use std::process::ExitCode;
use std::sync::Arc;

use agentqueue::backpressure::{BackpressureConfig, BackpressureController, FixedDepthSampler};
use agentqueue::config::{init_tracing, Config};
use agentqueue::dlq;
use agentqueue::event_log::EventLogWriter;
use agentqueue::producer::Producer;
use agentqueue::store;
use agentqueue::topology::TopologyManager;
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "agentqueue-dlq-replay")]
struct Args {
    #[arg(long)]
    org_id: Option<String>,

    /// Replay only this message id; omit to replay every replayable record.
    #[arg(long)]
    message_id: Option<uuid::Uuid>,

    /// List what would be replayed without publishing anything.
    #[arg(long)]
    dry_run: bool,

    /// Maximum number of records to replay in this invocation.
    #[arg(long, default_value_t = 100)]
    batch: usize,
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

    let event_store = match store::from_config(&config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "event store unavailable");
            return ExitCode::from(4);
        }
    };

    let records = match event_store.list_dlq_records(&org_id).await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to list dlq records");
            return ExitCode::from(4);
        }
    };

    let candidates: Vec<_> = records
        .into_iter()
        .filter(|r| r.can_replay)
        .filter(|r| args.message_id.map_or(true, |id| r.original_message.message_id == id))
        .take(args.batch)
        .collect();

    if candidates.is_empty() {
        info!(%org_id, "no replayable dlq records matched");
        return ExitCode::SUCCESS;
    }

    if args.dry_run {
        for record in &candidates {
            info!(%org_id, message_id = %record.original_message.message_id, reason = ?record.reason, "would replay");
        }
        return ExitCode::SUCCESS;
    }

    let topology = match TopologyManager::connect(&config.broker_url).await {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "broker unavailable");
            return ExitCode::from(3);
        }
    };

    let backpressure = Arc::new(BackpressureController::new(
        BackpressureConfig::default(),
        Arc::new(FixedDepthSampler::new()),
    ));
    let event_log = EventLogWriter::spawn(event_store.clone());
    let producer = Producer::new(topology.pool(), event_store.clone(), backpressure, event_log);

    let mut replayed = 0usize;
    let mut failed = 0usize;
    for record in candidates {
        let message_id = record.original_message.message_id;
        match dlq::replay(event_store.as_ref(), &org_id, message_id).await {
            Ok(message) => match producer.publish(message).await {
                Ok(_) => {
                    replayed += 1;
                    info!(%org_id, %message_id, "replayed");
                }
                Err(e) => {
                    failed += 1;
                    error!(error = %e, %org_id, %message_id, "replay publish failed");
                }
            },
            Err(e) => {
                failed += 1;
                warn!(error = %e, %org_id, %message_id, "replay could not claim dlq record");
            }
        }
    }

    info!(%org_id, replayed, failed, "dlq replay complete");
    if failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
