mod observability;
mod ticks;

use std::sync::Arc;
use std::time::Duration;

use quorum_domain::context::StoreContext;
use quorum_domain::host::{InMemoryAccountDirectory, InMemoryPostPublisher};
use quorum_domain::keys::KeySchema;
use quorum_domain::memory::InMemoryKvStore;
use quorum_domain::ports::accounts::AccountDirectory;
use quorum_domain::ports::kv::KeyValueStore;
use quorum_domain::ports::posts::PostPublisher;
use quorum_domain::retry::RetryPolicy;
use quorum_infra::host_client::HostPlatformClient;
use quorum_infra::kv::RedisKvStore;
use quorum_infra::{config::AppConfig, logging::init_tracing};
use tracing::{info, warn};

use crate::ticks::{TickSettings, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config, "quorum-worker")?;
    if config.metrics_enabled {
        observability::init_metrics(&config.metrics_listen_addr)?;
    }

    let kv: Arc<dyn KeyValueStore> = if config.uses_redis() {
        Arc::new(RedisKvStore::connect(&config.redis_url).await?)
    } else {
        warn!("using in-memory store; data is lost on shutdown");
        Arc::new(InMemoryKvStore::new())
    };
    let ctx = StoreContext::new(kv)
        .with_keys(KeySchema::new(config.key_prefix.clone()))
        .with_retry(RetryPolicy {
            max_attempts: config.tx_retry_attempts,
            base_delay_ms: config.tx_retry_base_ms,
            max_delay_ms: config.tx_retry_max_ms,
        });

    let (publisher, directory): (Arc<dyn PostPublisher>, Arc<dyn AccountDirectory>) =
        if config.host_configured() {
            let client = Arc::new(HostPlatformClient::from_config(&config));
            (
                client.clone() as Arc<dyn PostPublisher>,
                client as Arc<dyn AccountDirectory>,
            )
        } else {
            warn!("host platform not configured; posts and account lookups stay in process");
            (
                Arc::new(InMemoryPostPublisher::new()) as Arc<dyn PostPublisher>,
                Arc::new(InMemoryAccountDirectory::assume_all_present())
                    as Arc<dyn AccountDirectory>,
            )
        };

    let mut worker = Worker::new(
        ctx,
        publisher,
        directory,
        TickSettings {
            purge_budget_ms: config.purge_budget_ms,
            purge_batch_size: config.purge_batch_size,
            liveness_budget_ms: config.liveness_budget_ms,
            liveness_interval_ms: config.liveness_interval_ms,
        },
    );

    let tick_interval = Duration::from_millis(config.worker_tick_interval_ms.max(1));
    info!(
        backend = %config.data_backend,
        tick_interval_ms = config.worker_tick_interval_ms,
        "worker started"
    );

    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => worker.tick().await,
            _ = tokio::signal::ctrl_c() => {
                info!("worker shutdown");
                break;
            }
        }
    }

    Ok(())
}
