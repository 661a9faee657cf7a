use common::domain::{validate_struct, DomainResult, PollPolicy, RunMode, SourceRegion, TableRef};
use common::nats::NatsBusSettings;
use common::telemetry::TelemetryConfig;
use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use subscriber_worker::domain::DedupSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Pipeline resources
    #[serde(default = "default_project_id")]
    pub project_id: String,

    #[serde(default = "default_topic_id")]
    pub topic_id: String,

    #[serde(default = "default_subscription_id")]
    pub subscription_id: String,

    /// Maps to a ClickHouse database
    #[serde(default = "default_dataset_id")]
    pub dataset_id: String,

    #[serde(default = "default_table_id")]
    pub table_id: String,

    /// Origin tag stamped on published packets
    #[serde(default = "default_region")]
    pub region: String,

    /// `once` performs a single publish or listen cycle, `loop` repeats until shutdown
    #[serde(default)]
    pub run_mode: RunMode,

    #[serde(default = "default_channel_count")]
    pub channel_count: usize,

    #[serde(default = "default_publish_interval_secs")]
    pub publish_interval_secs: u64,

    /// How long each listen window stays open
    #[serde(default = "default_listen_timeout_secs")]
    pub listen_timeout_secs: u64,

    /// Pause between listen windows in loop mode
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "default_ack_deadline_secs")]
    pub ack_deadline_secs: u64,

    /// Upper bound on each store call made while handling a message
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,

    /// Messages handled concurrently per fetched batch
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    // NATS configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Batch size for consumer
    #[serde(default = "default_nats_batch_size")]
    pub nats_batch_size: usize,

    /// Max wait time for batches in seconds
    #[serde(default = "default_nats_batch_wait_secs")]
    pub nats_batch_wait_secs: u64,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // ClickHouse configuration
    /// ClickHouse HTTP URL
    #[serde(default = "default_clickhouse_url")]
    pub clickhouse_url: String,

    #[serde(default = "default_clickhouse_username")]
    pub clickhouse_username: String,

    #[serde(default = "default_clickhouse_password")]
    pub clickhouse_password: String,

    // Analytics
    /// Snapshot file reused by `analytics` instead of querying the table again
    #[serde(default)]
    pub analytics_cache_path: Option<PathBuf>,

    // OpenTelemetry configuration
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

// Pipeline defaults
fn default_project_id() -> String {
    "data-platform-v1-6".to_string()
}

fn default_topic_id() -> String {
    "streaming_data_packet_topic".to_string()
}

fn default_subscription_id() -> String {
    "streaming_data_packet_subscription".to_string()
}

fn default_dataset_id() -> String {
    "ds_data_platform".to_string()
}

fn default_table_id() -> String {
    "tbl_pubsub".to_string()
}

fn default_region() -> String {
    "us-east4".to_string()
}

fn default_channel_count() -> usize {
    5
}

fn default_publish_interval_secs() -> u64 {
    120
}

fn default_listen_timeout_secs() -> u64 {
    5
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_ack_deadline_secs() -> u64 {
    5
}

fn default_store_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    10
}

// NATS defaults
fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_batch_size() -> usize {
    30
}

fn default_nats_batch_wait_secs() -> u64 {
    5
}

fn default_startup_timeout_secs() -> u64 {
    30
}

// ClickHouse defaults
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_clickhouse_username() -> String {
    "default".to_string()
}

fn default_clickhouse_password() -> String {
    String::new()
}

// OpenTelemetry defaults
fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_service_name() -> String {
    "telemetry-pipeline".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(Environment::with_prefix("PIPELINE").try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_struct(&SourceRegion::new(&self.region))
            .map_err(|e| ConfigError::Message(format!("PIPELINE_REGION: {}", e)))?;
        if self.channel_count == 0 {
            return Err(ConfigError::Message(
                "PIPELINE_CHANNEL_COUNT must be positive".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Message(
                "PIPELINE_MAX_CONCURRENCY must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn table_ref(&self) -> DomainResult<TableRef> {
        TableRef::new(&self.project_id, &self.dataset_id, &self.table_id)
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            log_level: self.log_level.clone(),
        }
    }

    pub fn nats_bus_settings(&self) -> NatsBusSettings {
        NatsBusSettings {
            batch_size: self.nats_batch_size,
            fetch_wait: Duration::from_secs(self.nats_batch_wait_secs),
            max_concurrency: self.max_concurrency,
            ..NatsBusSettings::default()
        }
    }

    pub fn dedup_settings(&self) -> DedupSettings {
        DedupSettings {
            ack_deadline: Duration::from_secs(self.ack_deadline_secs),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::default()
    }
}
