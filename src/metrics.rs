//! Named counters/histograms (spec.md §6) and the `/metrics` HTTP endpoint.
//!
//! Keeps the teacher's shape — a small, centralized module of named
//! instruments that business logic calls into rather than defining ad hoc —
//! but on the `metrics` + `metrics-exporter-prometheus` crates instead of
//! OTel, since this crate needs a scraped Prometheus endpoint, not a full
//! collector export pipeline (see DESIGN.md).

use std::net::SocketAddr;

use axum::routing::get;
use axum::{extract::State, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Instrument names, dot-separated to match the teacher's convention.
pub mod names {
    pub const MESSAGES_PUBLISHED_TOTAL: &str = "agentqueue.messages.published.total";
    pub const MESSAGES_CONSUMED_TOTAL: &str = "agentqueue.messages.consumed.total";
    pub const MESSAGES_COMPLETED_TOTAL: &str = "agentqueue.messages.completed.total";
    pub const MESSAGES_FAILED_TOTAL: &str = "agentqueue.messages.failed.total";
    pub const MESSAGES_RETRIED_TOTAL: &str = "agentqueue.messages.retried.total";
    pub const MESSAGES_DEAD_LETTERED_TOTAL: &str = "agentqueue.messages.dead_lettered.total";
    pub const MESSAGES_DEMOTED_TOTAL: &str = "agentqueue.messages.demoted.total";
    pub const MESSAGES_PROMOTED_TOTAL: &str = "agentqueue.messages.promoted.total";
    pub const IDEMPOTENCY_DUPLICATES_TOTAL: &str = "agentqueue.idempotency.duplicates.total";
    pub const POISON_QUARANTINED_TOTAL: &str = "agentqueue.poison.quarantined.total";
    pub const BACKPRESSURE_REJECTED_TOTAL: &str = "agentqueue.backpressure.rejected.total";
    pub const PUBLISH_DURATION_SECONDS: &str = "agentqueue.publish.duration";
    pub const HANDLER_DURATION_SECONDS: &str = "agentqueue.handler.duration";
    pub const QUEUE_DEPTH: &str = "agentqueue.queue.depth";
    pub const WORKER_CONCURRENCY_IN_USE: &str = "agentqueue.worker.concurrency.in_use";
}

/// Register descriptions once at startup so the `/metrics` output carries
/// `# HELP` lines even before the first sample.
pub fn describe() {
    use metrics::{describe_counter, describe_histogram};

    describe_counter!(names::MESSAGES_PUBLISHED_TOTAL, "Messages accepted by the producer");
    describe_counter!(names::MESSAGES_CONSUMED_TOTAL, "Messages dequeued by a worker");
    describe_counter!(names::MESSAGES_COMPLETED_TOTAL, "Messages processed successfully");
    describe_counter!(names::MESSAGES_FAILED_TOTAL, "Messages that failed handling");
    describe_counter!(names::MESSAGES_RETRIED_TOTAL, "Messages requeued for retry");
    describe_counter!(names::MESSAGES_DEAD_LETTERED_TOTAL, "Messages moved to the DLQ");
    describe_counter!(names::MESSAGES_DEMOTED_TOTAL, "Messages demoted a priority level on retry");
    describe_counter!(names::MESSAGES_PROMOTED_TOTAL, "Messages promoted a priority level by aging");
    describe_counter!(names::IDEMPOTENCY_DUPLICATES_TOTAL, "Duplicate dedup_key claims rejected");
    describe_counter!(names::POISON_QUARANTINED_TOTAL, "Messages quarantined as poison");
    describe_counter!(names::BACKPRESSURE_REJECTED_TOTAL, "Publishes rejected by backpressure");
    describe_histogram!(names::PUBLISH_DURATION_SECONDS, "Producer publish latency");
    describe_histogram!(names::HANDLER_DURATION_SECONDS, "Worker handler execution latency");
    describe_histogram!(names::QUEUE_DEPTH, "Sampled queue depth");
    describe_histogram!(names::WORKER_CONCURRENCY_IN_USE, "In-flight handler permits held");
}

/// Install the global Prometheus recorder and serve `/metrics` on `port`.
/// Returns once the listener is bound; serving runs in a spawned task.
pub async fn serve(port: u16) -> Result<(), std::io::Error> {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    describe();

    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::names;

    #[test]
    fn instrument_names_follow_dot_separated_convention() {
        assert!(names::MESSAGES_PUBLISHED_TOTAL.starts_with("agentqueue."));
        assert!(names::QUEUE_DEPTH.contains('.'));
    }
}
