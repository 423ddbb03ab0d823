// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline configuration.
//!
//! Everything the pipeline needs is fixed at construction time in an
//! immutable [`PipelineConfig`] validated by [`PipelineConfig::validate`].
//! Invalid combinations (zero batch size, Loki without labels, ...) fail
//! fast instead of surfacing later as stuck lanes. [`PipelineConfig::from_env`]
//! builds a config from `RELAY_*` environment variables for binaries that
//! compose the pipeline at process start.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::debug;

/// Configuration errors surfaced at construction time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// What to do with a new event when its lane's queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueFullPolicy {
    /// Fail the `emit` with a typed error (default).
    #[default]
    Reject,
    /// Evict the oldest buffered event to make room.
    DropOldest,
    /// Wait for space up to `block_timeout`.
    Block,
}

impl FromStr for QueueFullPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "reject" => Ok(QueueFullPolicy::Reject),
            "drop_oldest" => Ok(QueueFullPolicy::DropOldest),
            "block" => Ok(QueueFullPolicy::Block),
            other => Err(ConfigError::InvalidConfig(format!(
                "Invalid queue_full_policy '{other}'. Must be one of: reject, drop_oldest, block"
            ))),
        }
    }
}

// Lenient string form for config files: unknown values fall back to the
// default policy with a debug log rather than failing deserialization.
impl<'de> Deserialize<'de> for QueueFullPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(QueueFullPolicy::from_str(&value).unwrap_or_else(|_| {
            debug!("Invalid queue full policy: {}, using default", value);
            QueueFullPolicy::default()
        }))
    }
}

/// Per-lane batch limits.
#[derive(Clone, Copy, Debug)]
pub struct BatchConfig {
    /// Close a batch at this many events.
    pub max_batch_size: usize,
    /// Close a batch once its oldest event is this old.
    pub max_batch_age: Duration,
}

/// Backoff schedule for transient send failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

/// Per-backend circuit breaker settings.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive transient failures before the breaker opens.
    pub threshold: u32,
    /// Time the breaker stays open before admitting one probe.
    pub cooldown: Duration,
}

#[derive(Clone, Debug)]
pub struct ElasticsearchConfig {
    /// Base URL, e.g. `http://elasticsearch:9200`.
    pub endpoint: String,
    /// Dated indices are named `{prefix}-{yyyy.MM.dd}`.
    pub index_prefix: String,
}

#[derive(Clone, Debug)]
pub struct LokiConfig {
    /// Base URL, e.g. `http://loki:3100`.
    pub endpoint: String,
    /// Static stream labels. Fixed per pipeline instance, never derived
    /// from event fields.
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct OtlpConfig {
    /// Base URL of an OTLP/HTTP collector, e.g. `http://jaeger:4318`.
    pub endpoint: String,
}

/// Immutable pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Service name stamped on every shipped event.
    pub service_name: String,
    /// Capacity of each lane's queue, in events.
    pub queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    /// Wait bound for the `block` policy.
    pub block_timeout: Duration,
    pub log_batch: BatchConfig,
    pub span_batch: BatchConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// Concurrent sends per backend.
    pub max_in_flight_per_backend: usize,
    /// Batches parked per backend while its breaker is open.
    pub spillover_capacity: usize,
    /// Dead-letter store capacity, in batches.
    pub dead_letter_capacity: usize,
    pub shutdown_grace: Duration,
    /// Per-request timeout for backend sends.
    pub request_timeout: Duration,
    pub elasticsearch: Option<ElasticsearchConfig>,
    pub loki: Option<LokiConfig>,
    pub otlp: Option<OtlpConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            service_name: "event-relay".to_string(),
            queue_capacity: 10_000,
            queue_full_policy: QueueFullPolicy::Reject,
            block_timeout: Duration::from_millis(100),
            log_batch: BatchConfig {
                max_batch_size: 500,
                max_batch_age: Duration::from_millis(2000),
            },
            span_batch: BatchConfig {
                max_batch_size: 128,
                max_batch_age: Duration::from_millis(2000),
            },
            retry: RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_millis(200),
                multiplier: 2.0,
                cap: Duration::from_millis(30_000),
            },
            breaker: BreakerConfig {
                threshold: 5,
                cooldown: Duration::from_millis(5000),
            },
            max_in_flight_per_backend: 4,
            spillover_capacity: 256,
            dead_letter_capacity: 1024,
            shutdown_grace: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            elasticsearch: None,
            loki: None,
            otlp: None,
        }
    }
}

impl PipelineConfig {
    /// Builds a configuration from `RELAY_*` environment variables, falling
    /// back to defaults for anything unset, then validates it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = PipelineConfig::default();

        if let Ok(name) = env::var("RELAY_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Some(capacity) = parse_env::<usize>("RELAY_QUEUE_CAPACITY") {
            config.queue_capacity = capacity;
        }
        if let Ok(policy) = env::var("RELAY_QUEUE_FULL_POLICY") {
            config.queue_full_policy = QueueFullPolicy::from_str(&policy)?;
        }
        if let Some(size) = parse_env::<usize>("RELAY_LOG_BATCH_SIZE") {
            config.log_batch.max_batch_size = size;
        }
        if let Some(ms) = parse_env::<u64>("RELAY_LOG_BATCH_AGE_MS") {
            config.log_batch.max_batch_age = Duration::from_millis(ms);
        }
        if let Some(size) = parse_env::<usize>("RELAY_SPAN_BATCH_SIZE") {
            config.span_batch.max_batch_size = size;
        }
        if let Some(ms) = parse_env::<u64>("RELAY_SPAN_BATCH_AGE_MS") {
            config.span_batch.max_batch_age = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_env::<u32>("RELAY_MAX_RETRY_ATTEMPTS") {
            config.retry.max_attempts = attempts;
        }
        if let Some(threshold) = parse_env::<u32>("RELAY_BREAKER_THRESHOLD") {
            config.breaker.threshold = threshold;
        }
        if let Some(ms) = parse_env::<u64>("RELAY_BREAKER_COOLDOWN_MS") {
            config.breaker.cooldown = Duration::from_millis(ms);
        }
        if let Some(in_flight) = parse_env::<usize>("RELAY_MAX_IN_FLIGHT_PER_BACKEND") {
            config.max_in_flight_per_backend = in_flight;
        }
        if let Some(ms) = parse_env::<u64>("RELAY_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(ms);
        }

        if let Ok(endpoint) = env::var("RELAY_ELASTIC_URL") {
            let index_prefix =
                env::var("RELAY_ELASTIC_INDEX_PREFIX").unwrap_or_else(|_| "relay-logs".to_string());
            config.elasticsearch = Some(ElasticsearchConfig {
                endpoint,
                index_prefix,
            });
        }
        if let Ok(endpoint) = env::var("RELAY_LOKI_URL") {
            let raw = env::var("RELAY_LOKI_LABELS")
                .unwrap_or_else(|_| format!("app:{},env:dev", config.service_name));
            config.loki = Some(LokiConfig {
                endpoint,
                labels: parse_labels(&raw)?,
            });
        }
        if let Ok(endpoint) = env::var("RELAY_OTLP_URL") {
            config.otlp = Some(OtlpConfig { endpoint });
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration, failing fast on unusable combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "service_name cannot be empty".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        for (lane, batch) in [("log", &self.log_batch), ("span", &self.span_batch)] {
            if batch.max_batch_size == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{lane} max_batch_size must be greater than 0"
                )));
            }
            if batch.max_batch_age.is_zero() {
                return Err(ConfigError::InvalidConfig(format!(
                    "{lane} max_batch_age must be greater than 0"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.breaker.threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "breaker.threshold must be at least 1".to_string(),
            ));
        }
        if self.max_in_flight_per_backend == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_in_flight_per_backend must be at least 1".to_string(),
            ));
        }
        if let Some(es) = &self.elasticsearch {
            if es.endpoint.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "elasticsearch.endpoint cannot be empty".to_string(),
                ));
            }
            if es.index_prefix.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "elasticsearch.index_prefix cannot be empty".to_string(),
                ));
            }
        }
        if let Some(loki) = &self.loki {
            if loki.endpoint.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "loki.endpoint cannot be empty".to_string(),
                ));
            }
            if loki.labels.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "loki.labels cannot be empty".to_string(),
                ));
            }
        }
        if let Some(otlp) = &self.otlp {
            if otlp.endpoint.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "otlp.endpoint cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Parses `key:value,key:value` label lists, the form used by
/// `RELAY_LOKI_LABELS`.
pub fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut labels = BTreeMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let Some((key, value)) = pair.split_once(':') else {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid label '{pair}', expected key:value"
            )));
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid label '{pair}', key and value must be non-empty"
            )));
        }
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}
