pub mod config;
pub mod host_client;
pub mod kv;
pub mod logging;
