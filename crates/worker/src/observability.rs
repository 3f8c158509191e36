use std::net::SocketAddr;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use quorum_domain::jobs::JobKind;

const TICKS_TOTAL: &str = "quorum_worker_ticks_total";
const TICK_DURATION_MS: &str = "quorum_worker_tick_duration_ms";
const POSTS_PUBLISHED_TOTAL: &str = "quorum_worker_posts_published_total";
const PUBLISH_FAILURES_TOTAL: &str = "quorum_worker_publish_failures_total";
const PUBLISH_SKIPPED_TOTAL: &str = "quorum_worker_publish_skipped_total";
const PURGE_OUTCOMES_TOTAL: &str = "quorum_worker_purge_outcomes_total";
const SWEEP_OUTCOMES_TOTAL: &str = "quorum_worker_sweep_outcomes_total";
const OWNERS_RETIRED_TOTAL: &str = "quorum_worker_owners_retired_total";
const RESPONSES_REMOVED_TOTAL: &str = "quorum_worker_responses_removed_total";
const PUBLISH_QUEUE_GAUGE: &str = "quorum_worker_publish_queue_depth";
const DELETE_QUEUE_GAUGE: &str = "quorum_worker_delete_queue_depth";

/// Installs the Prometheus recorder and its scrape listener. Must run inside
/// the tokio runtime.
pub fn init_metrics(listen_addr: &str) -> Result<()> {
    let addr: SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

pub fn register_tick(job: JobKind, result: &str, duration_ms: f64) {
    counter!(
        TICKS_TOTAL,
        "job" => job.as_str(),
        "result" => result.to_string()
    )
    .increment(1);

    histogram!(TICK_DURATION_MS, "job" => job.as_str()).record(duration_ms.max(0.0));
}

pub fn register_publish_report(published: usize, skipped: usize, failed: usize) {
    counter!(POSTS_PUBLISHED_TOTAL).increment(published as u64);
    counter!(PUBLISH_SKIPPED_TOTAL).increment(skipped as u64);
    counter!(PUBLISH_FAILURES_TOTAL).increment(failed as u64);
}

pub fn register_purge_outcome(outcome: &'static str) {
    counter!(PURGE_OUTCOMES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn register_sweep_outcome(outcome: &'static str, owners_retired: usize, responses_removed: usize) {
    counter!(SWEEP_OUTCOMES_TOTAL, "outcome" => outcome).increment(1);
    counter!(OWNERS_RETIRED_TOTAL).increment(owners_retired as u64);
    counter!(RESPONSES_REMOVED_TOTAL).increment(responses_removed as u64);
}

pub fn set_queue_depths(publish: u64, delete: u64) {
    gauge!(PUBLISH_QUEUE_GAUGE).set(publish as f64);
    gauge!(DELETE_QUEUE_GAUGE).set(delete as f64);
}
