//! Permanently purge dead-lettered messages older than a cutoff, without
//! replaying them.

use std::process::ExitCode;

use agentqueue::config::{init_tracing, Config};
use agentqueue::dlq;
use agentqueue::store;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "agentqueue-dlq-purge")]
struct Args {
    #[arg(long)]
    org_id: Option<String>,

    /// Purge only this message id; omit to purge every match.
    #[arg(long)]
    message_id: Option<uuid::Uuid>,

    /// Only purge records dead-lettered more than this many hours ago.
    #[arg(long)]
    older_than_hours: Option<i64>,

    #[arg(long)]
    dry_run: bool,
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

    let cutoff = args.older_than_hours.map(|hours| Utc::now() - ChronoDuration::hours(hours));

    let records = match event_store.list_dlq_records(&org_id).await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to list dlq records");
            return ExitCode::from(4);
        }
    };

    let candidates: Vec<_> = records
        .into_iter()
        .filter(|r| args.message_id.map_or(true, |id| r.original_message.message_id == id))
        .filter(|r| cutoff.map_or(true, |cutoff| r.dlq_timestamp <= cutoff))
        .collect();

    if candidates.is_empty() {
        info!(%org_id, "no dlq records matched");
        return ExitCode::SUCCESS;
    }

    if args.dry_run {
        for record in &candidates {
            info!(%org_id, message_id = %record.original_message.message_id, "would purge");
        }
        return ExitCode::SUCCESS;
    }

    let mut purged = 0usize;
    let mut failed = 0usize;
    for record in candidates {
        let message_id = record.original_message.message_id;
        match dlq::purge(event_store.as_ref(), &org_id, message_id).await {
            Ok(()) => {
                purged += 1;
                info!(%org_id, %message_id, "purged");
            }
            Err(e) => {
                failed += 1;
                error!(error = %e, %org_id, %message_id, "purge failed");
            }
        }
    }

    info!(%org_id, purged, failed, "dlq purge complete");
    if failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
