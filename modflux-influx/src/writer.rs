//! Batching sink writer.
//!
//! Producers (poll tasks) push samples through a cloneable [`SinkHandle`];
//! a single [`SinkWriter`] task drains the shared buffer in batches of at most
//! `batch_size`, either when a full batch is available or when the flush
//! interval elapses.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use modflux_common::Sample;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::PointSink;

/// Batching and retry settings.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum samples per write.
    pub batch_size: usize,
    /// Flush at least this often.
    pub flush_interval: Duration,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Initial backoff, doubled on every retry.
    pub retry_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Buffer bound; samples beyond it are refused.
    pub max_buffered: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            max_buffered: 10_000,
        }
    }
}

/// Writer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStats {
    pub samples_enqueued: u64,
    pub samples_overflowed: u64,
    pub samples_written: u64,
    pub samples_dropped: u64,
    pub batches_written: u64,
    pub batches_dropped: u64,
    pub batches_rejected: u64,
    pub write_retries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    samples_enqueued: AtomicU64,
    samples_overflowed: AtomicU64,
    samples_written: AtomicU64,
    samples_dropped: AtomicU64,
    batches_written: AtomicU64,
    batches_dropped: AtomicU64,
    batches_rejected: AtomicU64,
    write_retries: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    buffer: Mutex<VecDeque<Sample>>,
    notify: Notify,
    counters: Counters,
    batch_size: usize,
    max_buffered: usize,
}

impl Shared {
    fn take_batch(&self) -> Vec<Sample> {
        let mut buffer = self.buffer.lock();
        let n = buffer.len().min(self.batch_size);
        buffer.drain(..n).collect()
    }

    fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}

/// Result of writing one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The batch was accepted by the sink.
    Written(usize),
    /// The batch was dropped after a rejection or after exhausting retries.
    Dropped(usize),
}

/// Cloneable producer side of the writer.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    shared: Arc<Shared>,
}

impl SinkHandle {
    /// Queue samples for writing.
    ///
    /// Returns the number of samples accepted. When the buffer is full the
    /// remainder is refused and counted as overflowed.
    pub fn enqueue(&self, samples: Vec<Sample>) -> usize {
        let offered = samples.len();
        if offered == 0 {
            return 0;
        }

        let (accepted, buffered) = {
            let mut buffer = self.shared.buffer.lock();
            let room = self.shared.max_buffered.saturating_sub(buffer.len());
            let accepted = offered.min(room);
            buffer.extend(samples.into_iter().take(accepted));
            (accepted, buffer.len())
        };

        let counters = &self.shared.counters;
        counters
            .samples_enqueued
            .fetch_add(accepted as u64, Ordering::Relaxed);

        let refused = offered - accepted;
        if refused > 0 {
            counters
                .samples_overflowed
                .fetch_add(refused as u64, Ordering::Relaxed);
            warn!(
                refused,
                buffered,
                limit = self.shared.max_buffered,
                "Sink buffer full, refusing samples"
            );
        }

        if buffered >= self.shared.batch_size {
            self.shared.notify.notify_one();
        }

        accepted
    }

    /// Number of samples waiting to be written.
    pub fn buffered(&self) -> usize {
        self.shared.buffered()
    }

    /// Snapshot of the writer counters.
    pub fn stats(&self) -> WriterStats {
        let c = &self.shared.counters;
        WriterStats {
            samples_enqueued: c.samples_enqueued.load(Ordering::Relaxed),
            samples_overflowed: c.samples_overflowed.load(Ordering::Relaxed),
            samples_written: c.samples_written.load(Ordering::Relaxed),
            samples_dropped: c.samples_dropped.load(Ordering::Relaxed),
            batches_written: c.batches_written.load(Ordering::Relaxed),
            batches_dropped: c.batches_dropped.load(Ordering::Relaxed),
            batches_rejected: c.batches_rejected.load(Ordering::Relaxed),
            write_retries: c.write_retries.load(Ordering::Relaxed),
        }
    }
}

/// Consumer side: drains the buffer into a [`PointSink`].
pub struct SinkWriter<S> {
    sink: S,
    shared: Arc<Shared>,
    config: WriterConfig,
}

impl<S: PointSink> SinkWriter<S> {
    /// Create a writer and its producer handle.
    pub fn new(sink: S, config: WriterConfig) -> (Self, SinkHandle) {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            counters: Counters::default(),
            batch_size: config.batch_size.max(1),
            max_buffered: config.max_buffered,
        });

        let handle = SinkHandle {
            shared: shared.clone(),
        };

        (
            Self {
                sink,
                shared,
                config,
            },
            handle,
        )
    }

    /// Another producer handle for this writer.
    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run until the shutdown signal, then drain the buffer.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(
            batch_size = self.shared.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            "Sink writer started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_all().await;
                }
                _ = self.shared.notify.notified() => {
                    self.flush_full_batches().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let pending = self.shared.buffered();
        info!(pending, "Sink writer draining buffer");
        self.flush_all().await;

        let stats = self.handle().stats();
        info!(
            written = stats.samples_written,
            dropped = stats.samples_dropped,
            overflowed = stats.samples_overflowed,
            "Sink writer stopped"
        );
    }

    /// Write everything currently buffered, batch by batch.
    pub async fn flush_all(&self) -> Vec<FlushOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.flush_once().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn flush_full_batches(&self) {
        while self.shared.buffered() >= self.shared.batch_size {
            if self.flush_once().await.is_none() {
                break;
            }
        }
    }

    /// Take one batch from the buffer and write it. `None` when the buffer is empty.
    pub async fn flush_once(&self) -> Option<FlushOutcome> {
        let batch = self.shared.take_batch();
        if batch.is_empty() {
            return None;
        }
        Some(self.write_batch(batch).await)
    }

    async fn write_batch(&self, batch: Vec<Sample>) -> FlushOutcome {
        let counters = &self.shared.counters;
        let size = batch.len();
        let mut attempt: u32 = 0;

        loop {
            match self.sink.write(&batch).await {
                Ok(()) => {
                    counters
                        .samples_written
                        .fetch_add(size as u64, Ordering::Relaxed);
                    counters.batches_written.fetch_add(1, Ordering::Relaxed);
                    debug!(samples = size, attempt, "Batch flushed");
                    return FlushOutcome::Written(size);
                }
                Err(e) if !e.is_retryable() => {
                    counters
                        .samples_dropped
                        .fetch_add(size as u64, Ordering::Relaxed);
                    counters.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    counters.batches_rejected.fetch_add(1, Ordering::Relaxed);
                    error!(
                        samples = size,
                        error = %e,
                        "Sink rejected batch, dropping it; check sink credentials and database settings"
                    );
                    return FlushOutcome::Dropped(size);
                }
                Err(e) if attempt >= self.config.max_retries => {
                    counters
                        .samples_dropped
                        .fetch_add(size as u64, Ordering::Relaxed);
                    counters.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    error!(
                        samples = size,
                        attempts = attempt + 1,
                        error = %e,
                        "Sink write failed after retries, dropping batch"
                    );
                    return FlushOutcome::Dropped(size);
                }
                Err(e) => {
                    let delay = backoff_delay(
                        self.config.retry_backoff,
                        self.config.max_backoff,
                        attempt,
                    );
                    counters.write_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        samples = size,
                        attempt = attempt + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sink write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}
