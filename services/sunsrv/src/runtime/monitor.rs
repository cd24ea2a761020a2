//! Per-device runtime health
//!
//! The poll loop is the only writer; status publishers and the health file
//! read snapshots. All state sits behind one mutex and no method holds it
//! across an await point.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::sunspec::DeviceType;

/// Online state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Summary over all configured devices of one class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    Online,
    Partial,
    Offline,
}

impl fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Online => "online",
            Self::Partial => "partial",
            Self::Offline => "offline",
        })
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Consecutive failures before a device counts as offline
    pub offline_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Periodic model reverification
    pub model_verify_interval: Duration,
    /// Failure streak that triggers an early reverification
    pub model_verify_after_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            offline_threshold: 3,
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(60),
            model_verify_interval: Duration::from_secs(3600),
            model_verify_after_failures: 5,
        }
    }
}

/// Mutable health record of one device
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub device_type: DeviceType,
    pub unit_id: u8,
    pub consecutive_failures: u32,
    pub last_seen: Option<DateTime<Utc>>,
    /// Never decreases while the process runs
    pub cumulative_read_errors: u64,
    pub last_model_check: Option<Instant>,
    pub model_id: Option<u16>,
    backoff_until: Option<Instant>,
}

impl RuntimeState {
    fn new(device_type: DeviceType, unit_id: u8) -> Self {
        Self {
            device_type,
            unit_id,
            consecutive_failures: 0,
            last_seen: None,
            cumulative_read_errors: 0,
            last_model_check: None,
            model_id: None,
            backoff_until: None,
        }
    }

    fn status(&self, offline_threshold: u32) -> DeviceStatus {
        if self.last_seen.is_some() && self.consecutive_failures < offline_threshold.max(1) {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        }
    }
}

/// Result of recording a failed poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub consecutive_failures: u32,
    /// This failure crossed the offline threshold
    pub went_offline: bool,
    /// Skip the device for this long
    pub backoff: Option<Duration>,
    /// Re-read the model id before the next poll
    pub reverify: bool,
}

/// Published view of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeReport {
    pub device_type: DeviceType,
    pub unit_id: u8,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub read_errors: u64,
    pub consecutive_failures: u32,
    pub model_id: Option<u16>,
    pub uptime: String,
}

/// Point-in-time copy of the whole monitor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSnapshot {
    pub devices: Vec<RuntimeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverter_status: Option<AggregateStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_status: Option<AggregateStatus>,
    pub failed_cycles: u32,
    pub uptime: String,
}

#[derive(Debug, Default)]
struct MonitorInner {
    devices: BTreeMap<(DeviceType, u8), RuntimeState>,
    /// Poll cycles in a row without a single successful read
    failed_cycles: u32,
}

#[derive(Debug)]
pub struct RuntimeMonitor {
    config: MonitorConfig,
    started: Instant,
    inner: Mutex<MonitorInner>,
}

impl RuntimeMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            inner: Mutex::new(MonitorInner::default()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Create state for a configured device so it counts in aggregates before its first poll
    pub fn register(&self, device_type: DeviceType, unit_id: u8) {
        self.inner
            .lock()
            .devices
            .entry((device_type, unit_id))
            .or_insert_with(|| RuntimeState::new(device_type, unit_id));
    }

    /// Record a successful read; returns true when the device came back online
    pub fn record_success(&self, device_type: DeviceType, unit_id: u8, model_id: u16) -> bool {
        let threshold = self.config.offline_threshold;
        let mut inner = self.inner.lock();
        let state = inner
            .devices
            .entry((device_type, unit_id))
            .or_insert_with(|| RuntimeState::new(device_type, unit_id));

        let was_offline = state.status(threshold) == DeviceStatus::Offline;
        state.consecutive_failures = 0;
        state.last_seen = Some(Utc::now());
        state.backoff_until = None;
        state.model_id = Some(model_id);

        if was_offline {
            info!(unit_id, model_id, "{device_type} online");
        }
        was_offline
    }

    pub fn record_failure(&self, device_type: DeviceType, unit_id: u8) -> FailureOutcome {
        let threshold = self.config.offline_threshold.max(1);
        let mut inner = self.inner.lock();
        let state = inner
            .devices
            .entry((device_type, unit_id))
            .or_insert_with(|| RuntimeState::new(device_type, unit_id));

        state.cumulative_read_errors += 1;
        state.consecutive_failures += 1;
        let failures = state.consecutive_failures;

        let went_offline = failures == threshold && state.last_seen.is_some();
        if went_offline {
            warn!(unit_id, "{device_type} marked offline after {failures} consecutive errors");
        }

        let backoff = self.backoff_delay(failures);
        state.backoff_until = backoff.map(|delay| Instant::now() + delay);

        let reverify = state.last_seen.is_some()
            && self.config.model_verify_after_failures > 0
            && failures == self.config.model_verify_after_failures;

        FailureOutcome {
            consecutive_failures: failures,
            went_offline,
            backoff,
            reverify,
        }
    }

    /// Backoff for a device with `failures` consecutive errors
    ///
    /// Zero below the offline threshold, then base doubling per failure up to the cap.
    pub fn backoff_delay(&self, failures: u32) -> Option<Duration> {
        let threshold = self.config.offline_threshold.max(1);
        if failures < threshold {
            return None;
        }
        let extra = (failures - threshold).min(16);
        let delay = self.config.backoff_base.saturating_mul(1u32 << extra);
        Some(delay.min(self.config.backoff_max))
    }

    /// Remaining backoff of a device, if any
    pub fn backoff_remaining(&self, device_type: DeviceType, unit_id: u8) -> Option<Duration> {
        let inner = self.inner.lock();
        let until = inner.devices.get(&(device_type, unit_id))?.backoff_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    /// Whether the hourly model check is due; the first call only starts the clock
    pub fn model_check_due(&self, device_type: DeviceType, unit_id: u8) -> bool {
        let mut inner = self.inner.lock();
        let Some(state) = inner.devices.get_mut(&(device_type, unit_id)) else {
            return false;
        };
        match state.last_model_check {
            None => {
                state.last_model_check = Some(Instant::now());
                false
            },
            Some(at) => at.elapsed() >= self.config.model_verify_interval,
        }
    }

    pub fn mark_model_checked(&self, device_type: DeviceType, unit_id: u8, model_id: Option<u16>) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.devices.get_mut(&(device_type, unit_id)) {
            state.last_model_check = Some(Instant::now());
            if model_id.is_some() {
                state.model_id = model_id;
            }
        }
    }

    /// Close a poll cycle; returns the streak of cycles without any successful read
    pub fn record_cycle(&self, attempted: usize, succeeded: usize) -> u32 {
        let mut inner = self.inner.lock();
        if succeeded > 0 {
            inner.failed_cycles = 0;
        } else if attempted > 0 {
            inner.failed_cycles += 1;
        }
        inner.failed_cycles
    }

    pub fn failed_cycles(&self) -> u32 {
        self.inner.lock().failed_cycles
    }

    pub fn state(&self, device_type: DeviceType, unit_id: u8) -> Option<RuntimeState> {
        self.inner.lock().devices.get(&(device_type, unit_id)).cloned()
    }

    pub fn status(&self, device_type: DeviceType, unit_id: u8) -> Option<DeviceStatus> {
        let threshold = self.config.offline_threshold;
        self.inner
            .lock()
            .devices
            .get(&(device_type, unit_id))
            .map(|s| s.status(threshold))
    }

    /// Aggregate over one class, `None` when no device of that class is registered
    pub fn aggregate(&self, device_type: DeviceType) -> Option<AggregateStatus> {
        let inner = self.inner.lock();
        aggregate_of(&inner, device_type, self.config.offline_threshold)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        let threshold = self.config.offline_threshold;
        let uptime = format_uptime(self.uptime());
        let inner = self.inner.lock();

        let devices = inner
            .devices
            .values()
            .map(|s| RuntimeReport {
                device_type: s.device_type,
                unit_id: s.unit_id,
                status: s.status(threshold),
                last_seen: s.last_seen,
                read_errors: s.cumulative_read_errors,
                consecutive_failures: s.consecutive_failures,
                model_id: s.model_id,
                uptime: uptime.clone(),
            })
            .collect();

        RuntimeSnapshot {
            devices,
            inverter_status: aggregate_of(&inner, DeviceType::Inverter, threshold),
            meter_status: aggregate_of(&inner, DeviceType::Meter, threshold),
            failed_cycles: inner.failed_cycles,
            uptime,
        }
    }
}

fn aggregate_of(
    inner: &MonitorInner,
    device_type: DeviceType,
    threshold: u32,
) -> Option<AggregateStatus> {
    let (total, online) = inner
        .devices
        .values()
        .filter(|s| s.device_type == device_type)
        .fold((0usize, 0usize), |(total, online), s| {
            let up = s.status(threshold) == DeviceStatus::Online;
            (total + 1, online + usize::from(up))
        });

    match (total, online) {
        (0, _) => None,
        (t, o) if o == t => Some(AggregateStatus::Online),
        (_, 0) => Some(AggregateStatus::Offline),
        _ => Some(AggregateStatus::Partial),
    }
}

/// Coarse "Xd Xh Xm" rendering
pub fn format_uptime(uptime: Duration) -> String {
    let minutes = uptime.as_secs() / 60;
    let (days, hours, minutes) = (minutes / 1440, (minutes / 60) % 24, minutes % 60);
    format!("{days}d {hours}h {minutes}m")
}

#[cfg(test)]
mod tests {
    use super::*;

    const INV: DeviceType = DeviceType::Inverter;
    const METER: DeviceType = DeviceType::Meter;

    fn monitor() -> RuntimeMonitor {
        RuntimeMonitor::new(MonitorConfig::default())
    }

    #[test]
    fn test_three_failures_take_device_offline() {
        let monitor = monitor();
        monitor.register(INV, 1);
        monitor.record_success(INV, 1, 103);
        assert_eq!(monitor.aggregate(INV), Some(AggregateStatus::Online));

        assert!(!monitor.record_failure(INV, 1).went_offline);
        assert!(!monitor.record_failure(INV, 1).went_offline);
        assert_eq!(monitor.status(INV, 1), Some(DeviceStatus::Online));
        let third = monitor.record_failure(INV, 1);
        assert!(third.went_offline);
        assert_eq!(monitor.aggregate(INV), Some(AggregateStatus::Offline));

        let before = monitor.state(INV, 1).and_then(|s| s.last_seen);
        assert!(monitor.record_success(INV, 1, 103));
        let state = monitor.state(INV, 1).unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(monitor.status(INV, 1), Some(DeviceStatus::Online));
        assert!(state.last_seen >= before);
        assert_eq!(state.cumulative_read_errors, 3);
    }

    #[test]
    fn test_never_seen_device_is_offline() {
        let monitor = monitor();
        monitor.register(METER, 240);
        assert_eq!(monitor.status(METER, 240), Some(DeviceStatus::Offline));
        assert_eq!(monitor.aggregate(METER), Some(AggregateStatus::Offline));
    }

    #[test]
    fn test_partial_aggregate_and_missing_class() {
        let monitor = monitor();
        monitor.register(INV, 1);
        monitor.register(INV, 2);
        monitor.record_success(INV, 1, 103);
        assert_eq!(monitor.aggregate(INV), Some(AggregateStatus::Partial));
        assert_eq!(monitor.aggregate(METER), None);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.meter_status, None);
        assert_eq!(snapshot.devices.len(), 2);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("meter_status").is_none());
        assert_eq!(json["inverter_status"], "partial");
    }

    #[test]
    fn test_backoff_schedule() {
        let monitor = monitor();
        let delays: Vec<Option<u64>> = (1..=7)
            .map(|n| monitor.backoff_delay(n).map(|d| d.as_secs()))
            .collect();
        assert_eq!(
            delays,
            vec![None, None, Some(10), Some(20), Some(40), Some(60), Some(60)]
        );
        assert_eq!(monitor.backoff_delay(200), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_window_expires() {
        let monitor = monitor();
        for _ in 0..3 {
            monitor.record_failure(METER, 240);
        }
        assert!(monitor.backoff_remaining(METER, 240).is_some());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(monitor.backoff_remaining(METER, 240), None);
    }

    #[test]
    fn test_read_errors_never_decrease() {
        let monitor = monitor();
        monitor.record_failure(INV, 1);
        monitor.record_success(INV, 1, 113);
        monitor.record_failure(INV, 1);
        assert_eq!(monitor.state(INV, 1).unwrap().cumulative_read_errors, 2);
    }

    #[test]
    fn test_reverify_after_five_failures_of_seen_device() {
        let monitor = monitor();
        // Never seen: no reverification
        let outcomes: Vec<bool> = (0..5).map(|_| monitor.record_failure(INV, 2).reverify).collect();
        assert!(outcomes.iter().all(|r| !r));

        monitor.record_success(INV, 1, 103);
        let outcomes: Vec<bool> = (0..6).map(|_| monitor.record_failure(INV, 1).reverify).collect();
        assert_eq!(outcomes, vec![false, false, false, false, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_check_interval() {
        let monitor = monitor();
        monitor.register(INV, 1);
        assert!(!monitor.model_check_due(INV, 1));
        tokio::time::advance(Duration::from_secs(1800)).await;
        assert!(!monitor.model_check_due(INV, 1));
        tokio::time::advance(Duration::from_secs(1800)).await;
        assert!(monitor.model_check_due(INV, 1));
        monitor.mark_model_checked(INV, 1, Some(113));
        assert!(!monitor.model_check_due(INV, 1));
        assert_eq!(monitor.state(INV, 1).unwrap().model_id, Some(113));
    }

    #[test]
    fn test_failed_cycle_streak() {
        let monitor = monitor();
        assert_eq!(monitor.record_cycle(2, 0), 1);
        assert_eq!(monitor.record_cycle(2, 0), 2);
        // Nothing attempted, streak unchanged
        assert_eq!(monitor.record_cycle(0, 0), 2);
        assert_eq!(monitor.record_cycle(2, 1), 0);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(59)), "0d 0h 0m");
        assert_eq!(
            format_uptime(Duration::from_secs(2 * 86400 + 3 * 3600 + 4 * 60 + 5)),
            "2d 3h 4m"
        );
    }
}
