//! Night and sleep handling
//!
//! The DataManager powers down with the inverters at night. While the
//! controller is sleeping the poll loop stretches its interval; polls still
//! run, so a device coming back is noticed on the next attempt.

use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepMode {
    Active,
    Sleeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepReason {
    None,
    NightWindow,
    DeviceUnreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SleepState {
    pub mode: SleepMode,
    pub reason: SleepReason,
    pub since: Option<DateTime<Utc>>,
}

impl SleepState {
    pub fn active() -> Self {
        Self {
            mode: SleepMode::Active,
            reason: SleepReason::None,
            since: None,
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.mode == SleepMode::Sleeping
    }
}

#[derive(Debug, Clone)]
pub struct SleepConfig {
    pub night_mode_enabled: bool,
    pub night_start_hour: u32,
    pub night_end_hour: u32,
    /// Failed cycles in a row before the device is treated as unreachable
    pub consecutive_failures_for_sleep: u32,
    pub normal_interval: Duration,
    pub sleep_interval: Duration,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            night_mode_enabled: true,
            night_start_hour: 21,
            night_end_hour: 6,
            consecutive_failures_for_sleep: 3,
            normal_interval: Duration::from_secs(5),
            sleep_interval: Duration::from_secs(300),
        }
    }
}

/// Night window `[start, end)`, wrapping past midnight when `start > end`
pub fn is_night(hour: u32, start: u32, end: u32) -> bool {
    if start > end {
        hour >= start || hour < end
    } else {
        start <= hour && hour < end
    }
}

/// Reachability check of the Modbus host
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + std::fmt::Debug {
    async fn is_reachable(&self) -> bool;
}

/// ICMP echo through the system `ping` binary
#[derive(Debug, Clone)]
pub struct PingProbe {
    host: String,
    timeout: Duration,
}

impl PingProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ping");
        // Linux takes -W in seconds, macOS in milliseconds
        let wait = if cfg!(target_os = "macos") {
            self.timeout.as_millis().to_string()
        } else {
            self.timeout.as_secs().max(1).to_string()
        };
        cmd.args(["-c", "1", "-W", wait.as_str(), self.host.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn is_reachable(&self) -> bool {
        let deadline = self.timeout + Duration::from_secs(1);
        match tokio::time::timeout(deadline, self.command().status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("Ping of {} failed to run: {e}", self.host);
                false
            },
            Err(_) => {
                debug!("Ping of {} timed out", self.host);
                false
            },
        }
    }
}

/// Decides per cycle whether the device is expected to answer
#[derive(Debug)]
pub struct SleepController {
    config: SleepConfig,
    /// `None` when ping checking is disabled
    probe: Option<Box<dyn ReachabilityProbe>>,
    state: Mutex<SleepState>,
}

impl SleepController {
    pub fn new(config: SleepConfig, probe: Option<Box<dyn ReachabilityProbe>>) -> Self {
        Self {
            config,
            probe,
            state: Mutex::new(SleepState::active()),
        }
    }

    pub fn state(&self) -> SleepState {
        *self.state.lock()
    }

    pub fn is_night_now(&self) -> bool {
        self.is_night_at(Local::now().hour())
    }

    pub fn is_night_at(&self, hour: u32) -> bool {
        self.config.night_mode_enabled
            && is_night(hour, self.config.night_start_hour, self.config.night_end_hour)
    }

    /// Wait before the next cycle
    pub fn poll_interval(&self) -> Duration {
        if self.state().is_sleeping() {
            self.config.sleep_interval
        } else {
            self.config.normal_interval
        }
    }

    pub async fn evaluate_now(&self, failed_cycles: u32) -> SleepState {
        self.evaluate(Local::now().hour(), failed_cycles).await
    }

    /// Advance the state machine for one cycle
    ///
    /// The lock is not held while the probe runs.
    pub async fn evaluate(&self, hour: u32, failed_cycles: u32) -> SleepState {
        let current = self.state();

        let (mode, reason) = if self.is_night_at(hour) {
            (SleepMode::Sleeping, SleepReason::NightWindow)
        } else {
            let failing = failed_cycles >= self.config.consecutive_failures_for_sleep.max(1);
            let was_unreachable = current.reason == SleepReason::DeviceUnreachable;
            let unreachable = match &self.probe {
                Some(probe) if failing || was_unreachable => !probe.is_reachable().await,
                Some(_) => false,
                None => failing,
            };
            if unreachable {
                (SleepMode::Sleeping, SleepReason::DeviceUnreachable)
            } else {
                (SleepMode::Active, SleepReason::None)
            }
        };

        let mut state = self.state.lock();
        if state.mode != mode || state.reason != reason {
            match mode {
                SleepMode::Sleeping => info!(
                    "Entering sleep mode ({reason:?}), polling every {:?}",
                    self.config.sleep_interval
                ),
                SleepMode::Active => {
                    let slept = state
                        .since
                        .map(|since| (Utc::now() - since).num_seconds())
                        .unwrap_or(0);
                    info!("Exiting sleep mode after {slept}s");
                },
            }
            let since = match (state.mode, mode) {
                (SleepMode::Sleeping, SleepMode::Sleeping) => state.since,
                (_, SleepMode::Sleeping) => Some(Utc::now()),
                (_, SleepMode::Active) => None,
            };
            *state = SleepState { mode, reason, since };
        }
        *state
    }
}
