use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use vigil_domain::DetectorKind;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // HTTP configuration
    /// API server bind host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// API server bind port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Shared secret for the ingest endpoint; unset leaves ingest open
    #[serde(default)]
    pub ingest_api_key: Option<String>,

    /// Ingest requests allowed per client per minute
    #[serde(default = "default_ingest_rate_limit_per_min")]
    pub ingest_rate_limit_per_min: u32,

    // Anomaly engine configuration
    /// Engine selection: zscore, median-deviation or external
    #[serde(default = "default_anomaly_engine")]
    pub anomaly_engine: String,

    /// Detector window override (default 200 for zscore, 512 for
    /// median-deviation)
    #[serde(default)]
    pub anomaly_window_size: Option<usize>,

    /// Percentile cut for the median-deviation detector
    #[serde(default = "default_anomaly_threshold_percentile")]
    pub anomaly_threshold_percentile: f64,

    /// z-score anomaly threshold
    #[serde(default = "default_zscore_threshold")]
    pub zscore_threshold: f64,

    /// Create devices on first contact
    #[serde(default = "default_allow_auto_device")]
    pub allow_auto_device: bool,

    // MQTT configuration
    /// Enable the MQTT bridge
    #[serde(default)]
    pub mqtt_enable: bool,

    /// MQTT broker URL
    #[serde(default = "default_mqtt_broker_url")]
    pub mqtt_broker_url: String,

    /// Per-device batch size for MQTT points
    #[serde(default = "default_mqtt_batch_size")]
    pub mqtt_batch_size: usize,

    // External scorer configuration
    /// Enable the external ML scorer (with ANOMALY_ENGINE=external)
    #[serde(default)]
    pub external_ml_enable: bool,

    /// Base URL of the external scorer
    #[serde(default = "default_external_ml_url")]
    pub external_ml_url: String,

    /// Hard timeout for score-batch calls in milliseconds
    #[serde(default = "default_external_ml_timeout_ms")]
    pub external_ml_timeout_ms: u64,

    /// Points buffered per device before dispatching to the scorer
    #[serde(default = "default_external_ml_batch_size")]
    pub external_ml_batch_size: usize,

    // Pipeline configuration
    /// Bound of each pub/sub subscriber queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Seconds before an idle device worker is reaped
    #[serde(default = "default_worker_idle_timeout_secs")]
    pub worker_idle_timeout_secs: u64,

    /// Grace period for draining on shutdown, in seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    // PostgreSQL configuration
    /// PostgreSQL host
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    /// PostgreSQL port
    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    /// PostgreSQL database name
    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    /// PostgreSQL username
    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    /// PostgreSQL password
    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    /// Connection pool size
    #[serde(default = "default_postgres_pool_size")]
    pub postgres_pool_size: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

// HTTP defaults
fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    3001
}

fn default_ingest_rate_limit_per_min() -> u32 {
    20
}

// Anomaly engine defaults
fn default_anomaly_engine() -> String {
    "median-deviation".to_string()
}

fn default_anomaly_threshold_percentile() -> f64 {
    95.0
}

fn default_zscore_threshold() -> f64 {
    3.0
}

fn default_allow_auto_device() -> bool {
    true
}

// MQTT defaults
fn default_mqtt_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_mqtt_batch_size() -> usize {
    64
}

// External scorer defaults
fn default_external_ml_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_external_ml_timeout_ms() -> u64 {
    5000
}

fn default_external_ml_batch_size() -> usize {
    64
}

// Pipeline defaults
fn default_event_queue_capacity() -> usize {
    1024
}

fn default_worker_idle_timeout_secs() -> u64 {
    300
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

// PostgreSQL defaults
fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "vigil".to_string()
}

fn default_postgres_username() -> String {
    "vigil".to_string()
}

fn default_postgres_password() -> String {
    "vigil".to_string()
}

fn default_postgres_pool_size() -> usize {
    5
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::default())
            .build()?
            .try_deserialize()
    }

    /// Effective engine: `external` needs the scorer enabled, otherwise the
    /// default engine is used with a warning at startup.
    pub fn engine(&self) -> Result<DetectorKind, ConfigError> {
        let engine = DetectorKind::parse(&self.anomaly_engine).ok_or_else(|| {
            ConfigError::Message(format!("unknown ANOMALY_ENGINE '{}'", self.anomaly_engine))
        })?;
        if engine == DetectorKind::External && !self.external_ml_enable {
            tracing::warn!(
                "ANOMALY_ENGINE=external without EXTERNAL_ML_ENABLE, using median-deviation"
            );
            return Ok(DetectorKind::MedianDeviation);
        }
        Ok(engine)
    }

    pub fn external_ml_timeout(&self) -> Duration {
        Duration::from_millis(self.external_ml_timeout_ms)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
