//! Long-running worker process: one `Worker` per priority class for the
//! configured org, each consuming and dispatching to a demo `EchoHandler`.
//! Embedding crates are expected to supply their own `Handler` and build a
//! binary from this shape rather than link this one in directly.

use std::sync::Arc;
use std::time::Duration;

use agentqueue::config::{init_tracing, Config};
use agentqueue::dlq::{AmqpDeadLetterPublisher, DeadLetterPublisher, NoopDeadLetterPublisher};
use agentqueue::event_log::EventLogWriter;
use agentqueue::model::{Message, Priority, Response, ResponseType};
use agentqueue::poison::PoisonTracker;
use agentqueue::store;
use agentqueue::topology::TopologyManager;
use agentqueue::worker::{Handler, HandlerError, Worker, WorkerConfig};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Demo handler: echoes the payload back as the result. Stand-in for real
/// agent dispatch logic, which lives outside this crate.
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, message: &Message) -> Result<Response, HandlerError> {
        Ok(Response {
            request_id: message.message_id,
            response_type: ResponseType::Result,
            agent_id: message.agent_id.clone().unwrap_or_default(),
            timestamp: chrono::Utc::now(),
            chunk: None,
            chunk_index: None,
            data: Some(message.payload.clone()),
            error: None,
            percent: None,
            note: None,
            stage: None,
        })
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return std::process::ExitCode::from(2);
        }
    };

    let Some(org_id) = config.org_id.clone() else {
        error!("ORG_ID must be set to run a worker");
        return std::process::ExitCode::from(2);
    };

    let topology = match TopologyManager::connect(&config.broker_url).await {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "broker unavailable");
            return std::process::ExitCode::from(3);
        }
    };

    let event_store = match store::from_config(&config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "event store unavailable");
            return std::process::ExitCode::from(4);
        }
    };

    let poison = Arc::new(PoisonTracker::new(event_store.clone(), config.poison_threshold));
    let event_log = EventLogWriter::spawn(event_store.clone());
    let handler: Arc<dyn Handler> = Arc::new(EchoHandler);

    let dlq: Arc<dyn DeadLetterPublisher> =
        match AmqpDeadLetterPublisher::new(&config.broker_url, event_store.clone()).await {
            Ok(publisher) => Arc::new(publisher),
            Err(e) => {
                warn!(error = %e, "dead-letter publisher unavailable, falling back to no-op");
                Arc::new(NoopDeadLetterPublisher)
            }
        };

    let mut tasks = Vec::new();
    for priority in Priority::ALL {
        let worker = Worker::new(
            topology.pool(),
            event_store.clone(),
            poison.clone(),
            dlq.clone(),
            event_log.clone(),
            handler.clone(),
            WorkerConfig {
                org_id: org_id.clone(),
                priority,
                prefetch: config.worker.prefetch,
                concurrency: config.worker.concurrency,
            },
        );

        tasks.push(tokio::spawn(async move {
            loop {
                if let Err(e) = worker.run_once().await {
                    error!(error = %e, ?priority, "worker consumer dropped, reconnecting");
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }));
    }

    info!(%org_id, "worker running, press Ctrl+C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    for task in tasks {
        task.abort();
    }

    std::process::ExitCode::SUCCESS
}
