// Copyright (c) James Kassemi, SC, US. All rights reserved.

use config::Config;
use serde::{Deserialize, Serialize};

pub use config::ConfigError;

use crate::retry::RetryPolicy;

/// Top-level configuration for the snapshot capture system.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub spool: SpoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_lock_wait_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            lock_wait_ms: default_lock_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
}

fn default_max_retries() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_retry_jitter_ms() -> u64 {
    100
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
        }
    }
}

impl IngestConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_delay_ms, 5_000, self.retry_jitter_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_expired_after_days")]
    pub expired_after_days: i64,
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: i64,
}

fn default_expired_after_days() -> i64 {
    7
}

fn default_stale_after_days() -> i64 {
    30
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            expired_after_days: default_expired_after_days(),
            stale_after_days: default_stale_after_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_s")]
    pub tick_interval_s: u64,
}

fn default_tick_interval_s() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_s: default_tick_interval_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    #[serde(default = "default_spool_dir")]
    pub dir: String,
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,
}

fn default_spool_dir() -> String {
    "spool".to_string()
}

fn default_poll_interval_s() -> u64 {
    5
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: default_spool_dir(),
            poll_interval_s: default_poll_interval_s(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(config::File::with_name("config.toml").required(false))
            .add_source(config::Environment::with_prefix("SNAPVAULT").separator("__"))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        if config.database_url.is_empty() {
            return Err(ConfigError::Message(
                "SNAPVAULT__DATABASE_URL is required".to_string(),
            ));
        }
        Ok(config)
    }
}
