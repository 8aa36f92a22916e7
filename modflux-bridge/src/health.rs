//! Bridge health: per-device liveness and poll counters.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Consecutive failures after which a device is reported offline.
pub const OFFLINE_AFTER_FAILURES: u32 = 3;

/// Device availability status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Last poll succeeded.
    Online,
    /// Last poll failed, fewer than [`OFFLINE_AFTER_FAILURES`] in a row.
    Degraded,
    /// Several consecutive polls failed.
    Offline,
    /// Not polled yet.
    #[default]
    Unknown,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Liveness of one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceLiveness {
    pub status: DeviceStatus,
    /// Last successful poll (millis since epoch), 0 if never.
    pub last_seen: i64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Serializable view of [`PollHealth`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// "healthy", "degraded" or "error".
    pub status: String,
    pub uptime_secs: u64,
    pub devices_total: usize,
    pub devices_online: usize,
    pub devices_offline: usize,
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub ticks_started: u64,
    pub ticks_skipped: u64,
    pub samples_produced: u64,
    pub samples_skipped: u64,
    pub devices: BTreeMap<String, DeviceLiveness>,
}

/// Health tracker shared by the poller and the scheduler.
#[derive(Debug)]
pub struct PollHealth {
    start_time: Instant,
    devices: RwLock<BTreeMap<String, DeviceLiveness>>,
    polls_ok: AtomicU64,
    polls_failed: AtomicU64,
    ticks_started: AtomicU64,
    ticks_skipped: AtomicU64,
    samples_produced: AtomicU64,
    samples_skipped: AtomicU64,
}

impl PollHealth {
    /// Create a tracker with every device in the `Unknown` state.
    pub fn new<I, S>(device_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices = device_ids
            .into_iter()
            .map(|id| (id.into(), DeviceLiveness::default()))
            .collect();

        Self {
            start_time: Instant::now(),
            devices: RwLock::new(devices),
            polls_ok: AtomicU64::new(0),
            polls_failed: AtomicU64::new(0),
            ticks_started: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            samples_produced: AtomicU64::new(0),
            samples_skipped: AtomicU64::new(0),
        }
    }

    /// Record a successful poll and the samples it produced.
    pub fn record_success(&self, device_id: &str, produced: usize, skipped: usize) {
        let now = chrono::Utc::now().timestamp_millis();
        {
            let mut devices = self.devices.write();
            let state = devices.entry(device_id.to_string()).or_default();
            state.status = DeviceStatus::Online;
            state.last_seen = now;
            state.consecutive_failures = 0;
            state.last_error = None;
        }

        self.polls_ok.fetch_add(1, Ordering::Relaxed);
        self.samples_produced
            .fetch_add(produced as u64, Ordering::Relaxed);
        self.samples_skipped
            .fetch_add(skipped as u64, Ordering::Relaxed);
    }

    /// Record a failed poll. Returns the device's new status.
    pub fn record_failure(&self, device_id: &str, error: &str) -> DeviceStatus {
        let status = {
            let mut devices = self.devices.write();
            let state = devices.entry(device_id.to_string()).or_default();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_error = Some(error.to_string());
            state.status = if state.consecutive_failures >= OFFLINE_AFTER_FAILURES {
                DeviceStatus::Offline
            } else {
                DeviceStatus::Degraded
            };
            state.status
        };

        self.polls_failed.fetch_add(1, Ordering::Relaxed);
        status
    }

    pub fn record_tick_started(&self) {
        self.ticks_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a skipped tick. Returns the total skipped so far.
    pub fn record_tick_skipped(&self) -> u64 {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceLiveness> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.ticks_skipped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let devices = self.devices.read().clone();
        let devices_total = devices.len();
        let devices_online = devices
            .values()
            .filter(|d| matches!(d.status, DeviceStatus::Online | DeviceStatus::Degraded))
            .count();
        let devices_offline = devices
            .values()
            .filter(|d| d.status == DeviceStatus::Offline)
            .count();

        let status = if devices_offline == 0 {
            "healthy"
        } else if devices_offline < devices_total {
            "degraded"
        } else {
            "error"
        };

        HealthSnapshot {
            status: status.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            devices_total,
            devices_online,
            devices_offline,
            polls_ok: self.polls_ok.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            ticks_started: self.ticks_started.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            samples_produced: self.samples_produced.load(Ordering::Relaxed),
            samples_skipped: self.samples_skipped.load(Ordering::Relaxed),
            devices,
        }
    }
}
