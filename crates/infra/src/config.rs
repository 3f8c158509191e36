use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub log_level: String,
    pub data_backend: String,
    pub redis_url: String,
    pub key_prefix: String,
    pub host_base_url: String,
    pub host_platform_token: String,
    pub host_timeout_ms: u64,
    pub host_retry_max_attempts: u32,
    pub host_retry_backoff_base_ms: u64,
    pub host_retry_backoff_max_ms: u64,
    pub worker_tick_interval_ms: u64,
    pub purge_budget_ms: u64,
    pub purge_batch_size: usize,
    pub liveness_budget_ms: u64,
    pub liveness_interval_ms: u64,
    pub tx_retry_attempts: u32,
    pub tx_retry_base_ms: u64,
    pub tx_retry_max_ms: u64,
    pub metrics_enabled: bool,
    pub metrics_listen_addr: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("key_prefix", "quorum")?
            .set_default("host_base_url", "")?
            .set_default("host_platform_token", "")?
            .set_default("host_timeout_ms", 5_000)?
            .set_default("host_retry_max_attempts", 3)?
            .set_default("host_retry_backoff_base_ms", 200)?
            .set_default("host_retry_backoff_max_ms", 2_000)?
            .set_default("worker_tick_interval_ms", 60_000)?
            .set_default("purge_budget_ms", 25_000)?
            .set_default("purge_batch_size", 500)?
            .set_default("liveness_budget_ms", 25_000)?
            .set_default("liveness_interval_ms", 3_600_000)?
            .set_default("tx_retry_attempts", 4)?
            .set_default("tx_retry_base_ms", 10)?
            .set_default("tx_retry_max_ms", 200)?
            .set_default("metrics_enabled", true)?
            .set_default("metrics_listen_addr", "0.0.0.0:9464")?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn uses_redis(&self) -> bool {
        self.data_backend.eq_ignore_ascii_case("redis")
    }

    /// Empty base URL means posts and account lookups stay in process.
    pub fn host_configured(&self) -> bool {
        !self.host_base_url.trim().is_empty()
    }
}
