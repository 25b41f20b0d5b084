//! Long-running coordinator process: demultiplexes each configured agent's
//! response queue into its mailbox and logs delivered responses. A real
//! deployment would hand the mailbox receiver off to whatever transport
//! talks to the agent (a websocket, an SSE stream, ...) instead of logging.

use std::sync::Arc;
use std::time::Duration;

use agentqueue::config::{init_tracing, Config};
use agentqueue::coordinator::{Coordinator, CoordinatorConfig};
use agentqueue::dlq::{AmqpDeadLetterPublisher, DeadLetterPublisher, NoopDeadLetterPublisher};
use agentqueue::store;
use agentqueue::topology::TopologyManager;
use tracing::{error, info, warn};

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
        error!("ORG_ID must be set to run the coordinator");
        return std::process::ExitCode::from(2);
    };

    if config.agent_ids.is_empty() {
        error!("AGENT_IDS (or AGENT_ID) must name at least one agent to coordinate");
        return std::process::ExitCode::from(2);
    }

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

    let dlq: Arc<dyn DeadLetterPublisher> =
        match AmqpDeadLetterPublisher::new(&config.broker_url, event_store.clone()).await {
            Ok(publisher) => Arc::new(publisher),
            Err(e) => {
                warn!(error = %e, "dead-letter publisher unavailable, falling back to no-op");
                Arc::new(NoopDeadLetterPublisher)
            }
        };

    let coordinator_config = CoordinatorConfig {
        mailbox_capacity: config.coordinator.mailbox_capacity,
        overflow_policy: config.coordinator.mailbox_overflow_policy,
        liveness_timeout: Duration::from_millis(config.coordinator.liveness_timeout_ms),
    };
    let coordinator = Arc::new(Coordinator::new(
        topology.pool(),
        org_id.clone(),
        event_store,
        dlq,
        coordinator_config,
    ));

    let mut tasks = Vec::new();
    for agent_id in config.agent_ids.clone() {
        let mailbox = coordinator.register_agent(&agent_id).await;
        let coordinator = coordinator.clone();
        let consumer_agent_id = agent_id.clone();

        tasks.push(tokio::spawn(async move {
            loop {
                if let Err(e) = coordinator.run_agent_consumer(&consumer_agent_id).await {
                    error!(error = %e, agent_id = %consumer_agent_id, "coordinator consumer dropped, reconnecting");
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }));

        tasks.push(tokio::spawn(async move {
            while let Some(response) = mailbox.recv().await {
                info!(%agent_id, request_id = %response.request_id, response_type = ?response.response_type, "response delivered");
            }
        }));
    }

    {
        let coordinator = coordinator.clone();
        tasks.push(tokio::spawn(async move {
            coordinator.run_liveness_monitor(Duration::from_secs(30)).await;
        }));
    }

    info!(%org_id, agents = config.agent_ids.len(), "coordinator running, press Ctrl+C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    for task in tasks {
        task.abort();
    }

    std::process::ExitCode::SUCCESS
}
