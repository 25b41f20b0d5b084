//! Declare an org's queue topology (requests exchange, four priority
//! queues, DLQ exchange/queue, one response queue per configured agent)
//! and exit. Safe to run repeatedly against an already-provisioned org.

use std::process::ExitCode;

use agentqueue::config::{init_tracing, Config};
use agentqueue::topology::TopologyManager;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(2);
        }
    };

    let Some(org_id) = config.org_id.clone() else {
        error!("ORG_ID must be set to initialize topology");
        return ExitCode::from(2);
    };

    let topology = match TopologyManager::connect(&config.broker_url).await {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "broker unavailable");
            return ExitCode::from(3);
        }
    };

    if let Err(e) = topology.ensure_org_topology(&org_id).await {
        error!(error = %e, %org_id, "failed to declare org topology");
        return ExitCode::from(3);
    }
    info!(%org_id, "org topology declared");

    for agent_id in &config.agent_ids {
        if let Err(e) = topology.ensure_agent_queue(&org_id, agent_id).await {
            error!(error = %e, %org_id, %agent_id, "failed to declare agent queue");
            return ExitCode::from(3);
        }
        info!(%org_id, %agent_id, "agent response queue declared");
    }

    ExitCode::SUCCESS
}
