//! Poll scheduling.
//!
//! One [`IntervalGroup`] per distinct scan interval. Each group runs its own
//! timer; on every tick it fans out one poll per target, bounded by a
//! semaphore. A tick that fires while the previous one is still running is
//! skipped, never queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::poller::Poller;
use crate::registry::{PollTarget, TargetTable};

/// Outcome of one tick of an interval group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub polled: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Result of trying to start a tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// The tick's polls were dispatched.
    Started(JoinHandle<TickSummary>),
    /// The previous tick was still running.
    Skipped,
}

/// Clears the busy flag when the tick task ends, however it ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Targets sharing a scan interval.
#[derive(Debug)]
pub struct IntervalGroup {
    interval: Duration,
    targets: Arc<[Arc<PollTarget>]>,
    busy: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
    poller: Arc<Poller>,
}

impl IntervalGroup {
    pub fn new(
        interval: Duration,
        targets: Vec<Arc<PollTarget>>,
        poller: Arc<Poller>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            interval,
            targets: targets.into(),
            busy: Arc::new(AtomicBool::new(false)),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            poller,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn targets(&self) -> &[Arc<PollTarget>] {
        &self.targets
    }

    /// Whether a tick is currently running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Start a tick unless the previous one is still running.
    pub fn try_tick(&self) -> TickOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let skipped_total = self.poller.health().record_tick_skipped();
            debug!(
                interval_ms = self.interval.as_millis() as u64,
                skipped_total, "Previous tick still running, skipping"
            );
            return TickOutcome::Skipped;
        }

        self.poller.health().record_tick_started();

        let guard = BusyGuard(Arc::clone(&self.busy));
        let targets = Arc::clone(&self.targets);
        let permits = Arc::clone(&self.permits);
        let poller = Arc::clone(&self.poller);
        let interval = self.interval;

        TickOutcome::Started(tokio::spawn(async move {
            let _guard = guard;
            let started = Instant::now();

            let mut polls = JoinSet::new();
            for target in targets.iter() {
                let target = Arc::clone(target);
                let permits = Arc::clone(&permits);
                let poller = Arc::clone(&poller);
                polls.spawn(async move {
                    // The semaphore is never closed.
                    let _permit = permits.acquire_owned().await.ok();
                    poller.poll_and_record(&target).await
                });
            }

            let mut summary = TickSummary {
                polled: 0,
                failed: 0,
                elapsed: Duration::ZERO,
            };
            while let Some(result) = polls.join_next().await {
                summary.polled += 1;
                match result {
                    Ok(true) => {}
                    Ok(false) => summary.failed += 1,
                    Err(e) => {
                        summary.failed += 1;
                        warn!(error = %e, "Poll task failed");
                    }
                }
            }
            summary.elapsed = started.elapsed();

            debug!(
                interval_ms = interval.as_millis() as u64,
                polled = summary.polled,
                failed = summary.failed,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Tick complete"
            );
            summary
        }))
    }

    /// Tick until shutdown, then wait for the running tick to finish.
    ///
    /// The first tick fires one interval after start.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            targets = self.targets.len(),
            "Interval group started"
        );

        let mut in_flight: Option<JoinHandle<TickSummary>> = None;

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let TickOutcome::Started(handle) = self.try_tick() {
                        in_flight = Some(handle);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = in_flight
            && !handle.is_finished()
        {
            debug!(
                interval_ms = self.interval.as_millis() as u64,
                "Waiting for in-flight tick"
            );
            if let Err(e) = handle.await {
                warn!(error = %e, "Tick task failed during shutdown");
            }
        }

        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Interval group stopped"
        );
    }
}

/// Drives every interval group.
#[derive(Debug)]
pub struct Scheduler {
    groups: Vec<IntervalGroup>,
}

impl Scheduler {
    /// One group per distinct interval in the table.
    pub fn new(table: &TargetTable, poller: Arc<Poller>, max_concurrent: usize) -> Self {
        let groups = table
            .by_interval()
            .map(|(interval, targets)| {
                let targets = targets.into_iter().cloned().map(Arc::new).collect();
                IntervalGroup::new(interval, targets, Arc::clone(&poller), max_concurrent)
            })
            .collect();

        Self { groups }
    }

    pub fn groups(&self) -> &[IntervalGroup] {
        &self.groups
    }

    /// Run all groups until shutdown is signalled and their last ticks finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut groups = JoinSet::new();
        for group in self.groups {
            groups.spawn(group.run(shutdown.clone()));
        }

        while let Some(result) = groups.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Interval group task failed");
            }
        }

        info!("Scheduler stopped");
    }
}
