use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: Vec<String>,
    /// Namespace prepended to every derived topic name.
    #[serde(default)]
    pub topic_prefix: String,
    pub consumer_group: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_partitioner")]
    pub partitioner: String,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboxConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("RESILIENT_KAFKA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(Error::Config("kafka.bootstrap_servers must not be empty".to_string()));
        }
        if self.consumer.max_workers == 0 {
            return Err(Error::Config("consumer.max_workers must be at least 1".to_string()));
        }
        if self.outbox.page_size == 0 {
            return Err(Error::Config("outbox.page_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl KafkaConfig {
    pub fn bootstrap_servers(&self) -> String {
        self.bootstrap_servers.join(",")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl ConsumerConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl PostgresConfig {
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?connect_timeout={}",
            self.username,
            self.password,
            self.host,
            self.port,
            self.database,
            self.connect_timeout_secs
        )
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            poll_interval_ms: default_poll_interval_ms(),
            table: default_table(),
            postgres: None,
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_operation_timeout_secs() -> u64 {
    10
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_partitioner() -> String {
    "murmur2_random".to_string()
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_max_workers() -> usize {
    250
}

fn default_base_retry_delay_ms() -> u64 {
    1000
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    45_000
}

fn default_page_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_table() -> String {
    "outbox".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}
