//! Runtime configuration from environment variables
//!
//! Loaded once at startup (after `dotenv`) and passed to constructors.

use crate::pipeline::{AggregationConfig, BufferConfig, DedupConfig, ValidationPolicy};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// One day
const MAX_SKEW_MS: i64 = 86_400_000;
/// Ten years
const MAX_PAST_SECS: i64 = 315_360_000;
/// One year
const MAX_LATENESS_SECS: i64 = 31_536_000;
/// One day
const MAX_BUCKET_SECS: i64 = 86_400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuration for the ingestion service
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener for `POST /events` and queries
    pub api_addr: SocketAddr,

    /// Listener for `GET /metrics`
    pub metrics_addr: SocketAddr,

    /// Path to SQLite database file
    pub db_path: String,

    /// Directory of numbered `.sql` migration files
    pub schema_dir: String,

    /// Number of storage partitions (independent sequence spaces)
    pub partitions: u32,

    pub batch_max_events: usize,
    pub batch_max_delay_ms: u64,

    /// Queue slots per partition before appends are rejected as overloaded
    pub buffer_capacity: usize,

    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub retry_max_retries: u32,

    /// How long a request waits for durable acks
    pub ack_timeout_ms: u64,

    pub dedup_retention_secs: u64,
    pub dedup_slots: usize,
    pub dedup_shards: usize,

    /// Accepted clock skew into the future
    pub max_skew_ms: i64,
    /// Oldest accepted event age
    pub max_past_secs: i64,

    pub bucket_secs: i64,
    pub lateness_secs: i64,
    pub agg_poll_ms: u64,
    pub agg_batch_limit: usize,

    /// Largest accepted `POST /events` batch
    pub max_request_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            db_path: "data/adtrack.db".to_string(),
            schema_dir: "sql".to_string(),
            partitions: 4,
            batch_max_events: 500,
            batch_max_delay_ms: 50,
            buffer_capacity: 10_000,
            retry_initial_ms: 25,
            retry_max_ms: 1_000,
            retry_max_retries: 5,
            ack_timeout_ms: 5_000,
            dedup_retention_secs: 3_600,
            dedup_slots: 60,
            dedup_shards: 16,
            max_skew_ms: 5_000,
            max_past_secs: 604_800,
            bucket_secs: 60,
            lateness_secs: 600,
            agg_poll_ms: 200,
            agg_batch_limit: 5_000,
            max_request_events: 1_000,
        }
    }
}

impl Config {
    /// Load configuration from process environment variables
    ///
    /// Environment variables (all optional, see `Default`):
    /// - `ADTRACK_API_ADDR`, `ADTRACK_METRICS_ADDR`
    /// - `ADTRACK_DB_PATH`, `ADTRACK_SCHEMA_DIR`
    /// - `ADTRACK_PARTITIONS`
    /// - `ADTRACK_BATCH_MAX_EVENTS`, `ADTRACK_BATCH_MAX_DELAY_MS`, `ADTRACK_BUFFER_CAPACITY`
    /// - `ADTRACK_RETRY_INITIAL_MS`, `ADTRACK_RETRY_MAX_MS`, `ADTRACK_RETRY_MAX_RETRIES`
    /// - `ADTRACK_ACK_TIMEOUT_MS`
    /// - `ADTRACK_DEDUP_RETENTION_SECS`, `ADTRACK_DEDUP_SLOTS`, `ADTRACK_DEDUP_SHARDS`
    /// - `ADTRACK_MAX_SKEW_MS`, `ADTRACK_MAX_PAST_SECS`
    /// - `ADTRACK_BUCKET_SECS`, `ADTRACK_LATENESS_SECS`
    /// - `ADTRACK_AGG_POLL_MS`, `ADTRACK_AGG_BATCH_LIMIT`
    /// - `ADTRACK_MAX_REQUEST_EVENTS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            api_addr: parse_or(get("ADTRACK_API_ADDR"), "ADTRACK_API_ADDR", defaults.api_addr)?,
            metrics_addr: parse_or(
                get("ADTRACK_METRICS_ADDR"),
                "ADTRACK_METRICS_ADDR",
                defaults.metrics_addr,
            )?,
            db_path: get("ADTRACK_DB_PATH").unwrap_or(defaults.db_path),
            schema_dir: get("ADTRACK_SCHEMA_DIR").unwrap_or(defaults.schema_dir),
            partitions: parse_or(get("ADTRACK_PARTITIONS"), "ADTRACK_PARTITIONS", defaults.partitions)?,
            batch_max_events: parse_or(
                get("ADTRACK_BATCH_MAX_EVENTS"),
                "ADTRACK_BATCH_MAX_EVENTS",
                defaults.batch_max_events,
            )?,
            batch_max_delay_ms: parse_or(
                get("ADTRACK_BATCH_MAX_DELAY_MS"),
                "ADTRACK_BATCH_MAX_DELAY_MS",
                defaults.batch_max_delay_ms,
            )?,
            buffer_capacity: parse_or(
                get("ADTRACK_BUFFER_CAPACITY"),
                "ADTRACK_BUFFER_CAPACITY",
                defaults.buffer_capacity,
            )?,
            retry_initial_ms: parse_or(
                get("ADTRACK_RETRY_INITIAL_MS"),
                "ADTRACK_RETRY_INITIAL_MS",
                defaults.retry_initial_ms,
            )?,
            retry_max_ms: parse_or(get("ADTRACK_RETRY_MAX_MS"), "ADTRACK_RETRY_MAX_MS", defaults.retry_max_ms)?,
            retry_max_retries: parse_or(
                get("ADTRACK_RETRY_MAX_RETRIES"),
                "ADTRACK_RETRY_MAX_RETRIES",
                defaults.retry_max_retries,
            )?,
            ack_timeout_ms: parse_or(
                get("ADTRACK_ACK_TIMEOUT_MS"),
                "ADTRACK_ACK_TIMEOUT_MS",
                defaults.ack_timeout_ms,
            )?,
            dedup_retention_secs: parse_or(
                get("ADTRACK_DEDUP_RETENTION_SECS"),
                "ADTRACK_DEDUP_RETENTION_SECS",
                defaults.dedup_retention_secs,
            )?,
            dedup_slots: parse_or(get("ADTRACK_DEDUP_SLOTS"), "ADTRACK_DEDUP_SLOTS", defaults.dedup_slots)?,
            dedup_shards: parse_or(get("ADTRACK_DEDUP_SHARDS"), "ADTRACK_DEDUP_SHARDS", defaults.dedup_shards)?,
            max_skew_ms: parse_or(get("ADTRACK_MAX_SKEW_MS"), "ADTRACK_MAX_SKEW_MS", defaults.max_skew_ms)?,
            max_past_secs: parse_or(get("ADTRACK_MAX_PAST_SECS"), "ADTRACK_MAX_PAST_SECS", defaults.max_past_secs)?,
            bucket_secs: parse_or(get("ADTRACK_BUCKET_SECS"), "ADTRACK_BUCKET_SECS", defaults.bucket_secs)?,
            lateness_secs: parse_or(get("ADTRACK_LATENESS_SECS"), "ADTRACK_LATENESS_SECS", defaults.lateness_secs)?,
            agg_poll_ms: parse_or(get("ADTRACK_AGG_POLL_MS"), "ADTRACK_AGG_POLL_MS", defaults.agg_poll_ms)?,
            agg_batch_limit: parse_or(
                get("ADTRACK_AGG_BATCH_LIMIT"),
                "ADTRACK_AGG_BATCH_LIMIT",
                defaults.agg_batch_limit,
            )?,
            max_request_events: parse_or(
                get("ADTRACK_MAX_REQUEST_EVENTS"),
                "ADTRACK_MAX_REQUEST_EVENTS",
                defaults.max_request_events,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, i128); 12] = [
            ("ADTRACK_PARTITIONS", self.partitions as i128),
            ("ADTRACK_BATCH_MAX_EVENTS", self.batch_max_events as i128),
            ("ADTRACK_BUFFER_CAPACITY", self.buffer_capacity as i128),
            ("ADTRACK_RETRY_INITIAL_MS", self.retry_initial_ms as i128),
            ("ADTRACK_ACK_TIMEOUT_MS", self.ack_timeout_ms as i128),
            ("ADTRACK_DEDUP_RETENTION_SECS", self.dedup_retention_secs as i128),
            ("ADTRACK_DEDUP_SLOTS", self.dedup_slots as i128),
            ("ADTRACK_DEDUP_SHARDS", self.dedup_shards as i128),
            ("ADTRACK_BUCKET_SECS", self.bucket_secs as i128),
            ("ADTRACK_AGG_POLL_MS", self.agg_poll_ms as i128),
            ("ADTRACK_AGG_BATCH_LIMIT", self.agg_batch_limit as i128),
            ("ADTRACK_MAX_REQUEST_EVENTS", self.max_request_events as i128),
        ];
        for (key, value) in positive {
            if value <= 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let non_negative: [(&'static str, i64); 3] = [
            ("ADTRACK_MAX_SKEW_MS", self.max_skew_ms),
            ("ADTRACK_MAX_PAST_SECS", self.max_past_secs),
            ("ADTRACK_LATENESS_SECS", self.lateness_secs),
        ];
        for (key, value) in non_negative {
            if value < 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                    reason: "must not be negative".to_string(),
                });
            }
        }

        // chrono durations and timestamp arithmetic overflow far below i64::MAX
        let bounded: [(&'static str, i64, i64); 4] = [
            ("ADTRACK_MAX_SKEW_MS", self.max_skew_ms, MAX_SKEW_MS),
            ("ADTRACK_MAX_PAST_SECS", self.max_past_secs, MAX_PAST_SECS),
            ("ADTRACK_LATENESS_SECS", self.lateness_secs, MAX_LATENESS_SECS),
            ("ADTRACK_BUCKET_SECS", self.bucket_secs, MAX_BUCKET_SECS),
        ];
        for (key, value, max) in bounded {
            if value > max {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                    reason: format!("must be at most {}", max),
                });
            }
        }

        if self.retry_max_ms < self.retry_initial_ms {
            return Err(ConfigError::InvalidValue {
                key: "ADTRACK_RETRY_MAX_MS",
                value: self.retry_max_ms.to_string(),
                reason: format!("must be at least ADTRACK_RETRY_INITIAL_MS ({})", self.retry_initial_ms),
            });
        }

        Ok(())
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            max_skew: chrono::Duration::milliseconds(self.max_skew_ms),
            max_past: chrono::Duration::seconds(self.max_past_secs),
            ..ValidationPolicy::default()
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            retention: Duration::from_secs(self.dedup_retention_secs),
            slots: self.dedup_slots,
            shards: self.dedup_shards,
        }
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            max_batch_events: self.batch_max_events,
            max_batch_delay: Duration::from_millis(self.batch_max_delay_ms),
            capacity: self.buffer_capacity,
            retry_initial: Duration::from_millis(self.retry_initial_ms),
            retry_max: Duration::from_millis(self.retry_max_ms),
            max_retries: self.retry_max_retries,
        }
    }

    pub fn aggregation_config(&self) -> AggregationConfig {
        AggregationConfig {
            bucket_secs: self.bucket_secs,
            lateness: chrono::Duration::seconds(self.lateness_secs),
            poll_interval: Duration::from_millis(self.agg_poll_ms),
            batch_limit: self.agg_batch_limit,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

fn parse_or<T>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::InvalidValue {
                key,
                reason: e.to_string(),
                value,
            }),
        },
    }
}
