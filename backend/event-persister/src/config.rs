use pubsub::RedisStreamConfig;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{PersisterError, Result};
use crate::services::persister::{
    PersisterOptions, DEFAULT_FLUSH_SIZE, DEFAULT_MAX_MPS, DEFAULT_NUM_WORKERS,
};

/// Process configuration, read from the environment
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    // Subscription
    #[serde(default = "default_pubsub_topic")]
    pub pubsub_topic: String,
    #[serde(default = "default_pubsub_subscription")]
    pub pubsub_subscription: String,
    #[serde(default = "default_pubsub_partition_count")]
    pub pubsub_partition_count: usize,
    #[serde(default = "default_pubsub_batch_size")]
    pub pubsub_batch_size: usize,
    #[serde(default = "default_pubsub_block_ms")]
    pub pubsub_block_ms: u64,
    #[serde(default = "default_pubsub_idle_secs")]
    pub pubsub_idle_secs: u64,
    #[serde(default = "default_pubsub_reclaim_interval_secs")]
    pub pubsub_reclaim_interval_secs: u64,
    #[serde(default = "default_pubsub_max_consecutive_errors")]
    pub pubsub_max_consecutive_errors: u32,

    // Batching
    #[serde(default = "default_max_mps")]
    pub max_mps: u32,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,

    // Experiment service
    #[serde(default = "default_experiment_service_url")]
    pub experiment_service_url: String,
    #[serde(default)]
    pub experiment_service_token: Option<String>,
    #[serde(default = "default_experiment_request_timeout_secs")]
    pub experiment_request_timeout_secs: u64,

    // Warehouse
    #[serde(default = "default_clickhouse_url")]
    pub clickhouse_url: String,
    #[serde(default = "default_clickhouse_database")]
    pub clickhouse_database: String,
    #[serde(default = "default_clickhouse_user")]
    pub clickhouse_user: String,
    #[serde(default)]
    pub clickhouse_password: String,
    #[serde(default = "default_evaluation_event_table")]
    pub evaluation_event_table: String,
    #[serde(default = "default_goal_event_table")]
    pub goal_event_table: String,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub log_format: Option<String>,
}

fn default_port() -> u16 {
    8080
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pubsub_topic() -> String {
    "events".to_string()
}

fn default_pubsub_subscription() -> String {
    "event-persister-dwh".to_string()
}

fn default_pubsub_partition_count() -> usize {
    1
}

fn default_pubsub_batch_size() -> usize {
    10
}

fn default_pubsub_block_ms() -> u64 {
    5000
}

fn default_pubsub_idle_secs() -> u64 {
    60
}

fn default_pubsub_reclaim_interval_secs() -> u64 {
    30
}

fn default_pubsub_max_consecutive_errors() -> u32 {
    10
}

fn default_max_mps() -> u32 {
    DEFAULT_MAX_MPS
}

fn default_num_workers() -> usize {
    DEFAULT_NUM_WORKERS
}

fn default_flush_size() -> usize {
    DEFAULT_FLUSH_SIZE
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_flush_timeout_secs() -> u64 {
    20
}

fn default_experiment_service_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_experiment_request_timeout_secs() -> u64 {
    10
}

fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_clickhouse_database() -> String {
    "default".to_string()
}

fn default_clickhouse_user() -> String {
    "default".to_string()
}

fn default_evaluation_event_table() -> String {
    "evaluation_event".to_string()
}

fn default_goal_event_table() -> String {
    "goal_event".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config: Config =
            envy::from_env().map_err(|e| PersisterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(PersisterError::Config("NUM_WORKERS must be at least 1".into()));
        }
        if self.flush_size == 0 {
            return Err(PersisterError::Config("FLUSH_SIZE must be at least 1".into()));
        }
        if self.max_mps == 0 {
            return Err(PersisterError::Config("MAX_MPS must be at least 1".into()));
        }
        if self.flush_interval_secs == 0 || self.flush_timeout_secs == 0 {
            return Err(PersisterError::Config(
                "FLUSH_INTERVAL_SECS and FLUSH_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        if self.pubsub_partition_count == 0 {
            return Err(PersisterError::Config(
                "PUBSUB_PARTITION_COUNT must be at least 1".into(),
            ));
        }
        if self.pubsub_reclaim_interval_secs == 0 {
            return Err(PersisterError::Config(
                "PUBSUB_RECLAIM_INTERVAL_SECS must be at least 1".into(),
            ));
        }
        // A flush in progress must be able to settle before shutdown gives up on it
        if self.shutdown_timeout_secs < self.flush_timeout_secs {
            return Err(PersisterError::Config(format!(
                "SHUTDOWN_TIMEOUT_SECS ({}) must not be shorter than FLUSH_TIMEOUT_SECS ({})",
                self.shutdown_timeout_secs, self.flush_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn json_logs(&self) -> bool {
        self.log_format
            .as_deref()
            .is_some_and(|format| format.eq_ignore_ascii_case("json"))
    }

    pub fn stream_config(&self) -> RedisStreamConfig {
        let mut config =
            RedisStreamConfig::new(self.pubsub_topic.clone(), self.pubsub_subscription.clone());
        config.partition_count = self.pubsub_partition_count;
        config.batch_size = self.pubsub_batch_size;
        config.block = Duration::from_millis(self.pubsub_block_ms);
        config.idle_time = Duration::from_secs(self.pubsub_idle_secs);
        config.reclaim_interval = Duration::from_secs(self.pubsub_reclaim_interval_secs);
        config.max_consecutive_errors = self.pubsub_max_consecutive_errors;
        config
    }

    /// Batching tunables; metrics and clock keep their defaults
    pub fn persister_options(&self) -> PersisterOptions {
        PersisterOptions::default()
            .with_max_mps(self.max_mps)
            .with_num_workers(self.num_workers)
            .with_flush_size(self.flush_size)
            .with_flush_interval(Duration::from_secs(self.flush_interval_secs))
            .with_flush_timeout(Duration::from_secs(self.flush_timeout_secs))
    }

    pub fn experiment_request_timeout(&self) -> Duration {
        Duration::from_secs(self.experiment_request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
