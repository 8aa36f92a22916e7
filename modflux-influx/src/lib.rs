//! InfluxDB sink for modflux.
//!
//! Samples produced by the Modbus poller are buffered by a [`SinkHandle`]
//! and flushed in batches by a [`SinkWriter`] through a [`PointSink`]
//! (normally an [`InfluxClient`] speaking the HTTP write API).
//!
//! # Failure policy
//!
//! - Retryable failures (network errors, HTTP 5xx, 408, 429) are retried with
//!   exponential backoff up to `max_retries`; the batch is then dropped.
//! - Non-retryable rejections (bad credentials, malformed data) drop the batch
//!   immediately.
//! - Every dropped sample is counted in [`WriterStats`].

pub mod client;
pub mod config;
pub mod error;
pub mod line;
pub mod writer;

pub use client::{InfluxClient, PointSink};
pub use config::{InfluxApi, InfluxConfig};
pub use error::SinkError;
pub use writer::{FlushOutcome, SinkHandle, SinkWriter, WriterConfig, WriterStats};
