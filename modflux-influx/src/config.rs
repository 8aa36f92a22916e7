//! Sink configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::writer::WriterConfig;

/// InfluxDB sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Base URL of the InfluxDB server (e.g. "http://localhost:8086").
    pub url: String,

    /// Write API flavour and target database identifiers.
    pub api: InfluxApi,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum number of samples per write request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush the buffer at least this often, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Retries after the first failed attempt before a batch is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry backoff in milliseconds (doubled on every retry).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound for the retry backoff in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Samples held in memory before new samples are refused.
    #[serde(default = "default_max_buffered_samples")]
    pub max_buffered_samples: usize,
}

/// Write API flavour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "version", rename_all = "lowercase")]
pub enum InfluxApi {
    /// InfluxDB 1.x `/write` endpoint.
    V1 {
        /// Target database.
        database: String,
        /// Optional retention policy.
        #[serde(default)]
        retention_policy: Option<String>,
        /// Optional basic-auth user.
        #[serde(default)]
        username: Option<String>,
        /// Optional basic-auth password.
        #[serde(default)]
        password: Option<String>,
    },
    /// InfluxDB 2.x `/api/v2/write` endpoint.
    V2 {
        /// Organization name or id.
        org: String,
        /// Target bucket.
        bucket: String,
        /// API token.
        token: String,
    },
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_batch_size() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_buffered_samples() -> usize {
    10_000
}

impl InfluxConfig {
    /// HTTP request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Batching and retry settings for the [`SinkWriter`](crate::SinkWriter).
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_buffered: self.max_buffered_samples,
        }
    }

    /// Named duration settings, for validation.
    pub fn durations_ms(&self) -> [(&'static str, u64); 4] {
        [
            ("influxdb.timeout_ms", self.timeout_ms),
            ("influxdb.flush_interval_ms", self.flush_interval_ms),
            ("influxdb.retry_backoff_ms", self.retry_backoff_ms),
            ("influxdb.max_backoff_ms", self.max_backoff_ms),
        ]
    }
}
