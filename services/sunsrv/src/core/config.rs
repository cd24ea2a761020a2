//! Service configuration
//!
//! Sources, lowest priority first:
//! 1. built-in defaults
//! 2. YAML file (`config/fronius_modbus.yaml` unless `-c` is given)
//! 3. `SUNSRV_` environment variables, `__` separating sections
//!    (`SUNSRV_MODBUS__HOST`)
//! 4. the flat variables of older deployments (`MODBUS_HOST`, `INVERTER_IDS`, ...)

use common::serde_helpers::{deserialize_bool_flexible, deserialize_optional_path, deserialize_unit_ids};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::value::{Uncased, UncasedStr};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::transport::{SessionConfig, TcpTransportConfig};
use crate::device::ResolverConfig;
use crate::error::{Result, SunSrvError};
use crate::runtime::{MonitorConfig, PollerConfig, ReconnectPolicy, SleepConfig};

pub const DEFAULT_CONFIG_PATH: &str = "config/fronius_modbus.yaml";
pub const ENV_PREFIX: &str = "SUNSRV_";

/// Flat environment names and the keys they set
const LEGACY_ENV: &[(&str, &str)] = &[
    ("MODBUS_HOST", "modbus.host"),
    ("MODBUS_PORT", "modbus.port"),
    ("MODBUS_TIMEOUT", "modbus.timeout_secs"),
    ("MODBUS_RETRY_ATTEMPTS", "modbus.retry_attempts"),
    ("MODBUS_NIGHT_MODE", "modbus.night_mode_enabled"),
    ("MODBUS_PING_CHECK", "modbus.ping_check_enabled"),
    ("INVERTER_IDS", "devices.inverters"),
    ("METER_IDS", "devices.meters"),
    ("INVERTER_POLL_DELAY", "devices.inverter_poll_delay_secs"),
    ("METER_POLL_INTERVAL", "devices.meter_poll_interval_secs"),
    ("INVERTER_READ_DELAY_MS", "devices.inverter_read_delay_ms"),
    ("LOG_LEVEL", "general.log_level"),
    ("POLL_INTERVAL", "general.poll_interval_secs"),
    ("PUBLISH_MODE", "general.publish_mode"),
];

/// Highest unit id Modbus allows for a device
const MAX_UNIT_ID: u8 = 247;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: f64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub connect_max_attempts: u32,
    pub connect_initial_delay_secs: u64,
    pub connect_max_delay_secs: u64,
    pub reconnect_period_secs: u64,
    pub max_registers_per_read: u16,
    #[serde(deserialize_with = "deserialize_bool_flexible")]
    pub night_mode_enabled: bool,
    pub night_start_hour: u32,
    pub night_end_hour: u32,
    pub night_poll_interval_secs: u64,
    #[serde(deserialize_with = "deserialize_bool_flexible")]
    pub ping_check_enabled: bool,
    pub ping_timeout_secs: u64,
    pub consecutive_failures_for_sleep: u32,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 502,
            timeout_secs: 3.0,
            retry_attempts: 2,
            retry_delay_ms: 100,
            connect_max_attempts: 10,
            connect_initial_delay_secs: 2,
            connect_max_delay_secs: 60,
            reconnect_period_secs: 30,
            max_registers_per_read: 125,
            night_mode_enabled: true,
            night_start_hour: 21,
            night_end_hour: 6,
            night_poll_interval_secs: 300,
            ping_check_enabled: true,
            ping_timeout_secs: 2,
            consecutive_failures_for_sleep: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    #[serde(deserialize_with = "deserialize_unit_ids")]
    pub inverters: Vec<u8>,
    #[serde(deserialize_with = "deserialize_unit_ids")]
    pub meters: Vec<u8>,
    pub inverter_poll_delay_secs: f64,
    pub meter_poll_interval_secs: f64,
    pub inverter_read_delay_ms: u64,
    pub controls_poll_interval_secs: u64,
    pub offline_threshold: u32,
    pub model_verify_interval_secs: u64,
    pub model_verify_after_failures: u32,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            inverters: vec![1],
            meters: vec![240],
            inverter_poll_delay_secs: 1.0,
            meter_poll_interval_secs: 2.0,
            inverter_read_delay_ms: 200,
            controls_poll_interval_secs: 60,
            offline_threshold: 3,
            model_verify_interval_secs: 3600,
            model_verify_after_failures: 5,
        }
    }
}

/// What downstream publishers forward
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Only values that differ from the previous poll
    #[default]
    Changed,
    /// Every value of every poll
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    #[serde(deserialize_with = "deserialize_optional_path")]
    pub log_dir: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub publish_mode: PublishMode,
    pub cache_path: PathBuf,
    #[serde(deserialize_with = "deserialize_optional_path")]
    pub health_file: Option<PathBuf>,
    pub status_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            log_dir: None,
            poll_interval_secs: 5,
            publish_mode: PublishMode::Changed,
            cache_path: PathBuf::from("data/device_cache.json"),
            health_file: Some(PathBuf::from("/tmp/fronius_health")),
            status_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub modbus: ModbusConfig,
    pub devices: DevicesConfig,
    pub general: GeneralConfig,
}

fn secs_f64(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

fn legacy_env() -> Env {
    Env::raw().filter_map(|key: &UncasedStr| {
        LEGACY_ENV
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map(|(_, path)| Uncased::from(*path))
    })
}

impl AppConfig {
    /// Layered provider chain; `path` overrides the default file location
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(legacy_env())
    }

    /// Load and validate
    ///
    /// An explicitly given file must exist; the default one is optional so
    /// the service can run from environment variables alone.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(SunSrvError::config(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
        }
        let config: AppConfig = Self::figment(path).extract()?;
        config.validate()?;
        debug!(
            "Configuration loaded: {}:{} inverters={:?} meters={:?}",
            config.modbus.host, config.modbus.port, config.devices.inverters, config.devices.meters
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let modbus = &self.modbus;
        if modbus.host.trim().is_empty() {
            return Err(SunSrvError::config("modbus.host is required"));
        }
        if modbus.port == 0 {
            return Err(SunSrvError::config("modbus.port must be non-zero"));
        }
        if !modbus.timeout_secs.is_finite() || modbus.timeout_secs <= 0.0 {
            return Err(SunSrvError::config(format!(
                "modbus.timeout_secs must be positive, got {}",
                modbus.timeout_secs
            )));
        }
        if !(1..=125).contains(&modbus.max_registers_per_read) {
            return Err(SunSrvError::config(format!(
                "modbus.max_registers_per_read must be 1-125, got {}",
                modbus.max_registers_per_read
            )));
        }
        for (key, hour) in [
            ("night_start_hour", modbus.night_start_hour),
            ("night_end_hour", modbus.night_end_hour),
        ] {
            if hour > 23 {
                return Err(SunSrvError::config(format!(
                    "modbus.{key} must be 0-23, got {hour}"
                )));
            }
        }

        let devices = &self.devices;
        if devices.inverters.is_empty() && devices.meters.is_empty() {
            return Err(SunSrvError::config("no inverters or meters configured"));
        }
        for (key, ids) in [("inverters", &devices.inverters), ("meters", &devices.meters)] {
            if let Some(id) = ids.iter().find(|id| !(1..=MAX_UNIT_ID).contains(*id)) {
                return Err(SunSrvError::config(format!(
                    "devices.{key}: unit id {id} outside 1-{MAX_UNIT_ID}"
                )));
            }
        }
        let inverters: HashSet<u8> = devices.inverters.iter().copied().collect();
        if let Some(id) = devices.meters.iter().find(|id| inverters.contains(*id)) {
            return Err(SunSrvError::config(format!(
                "unit id {id} configured as both inverter and meter"
            )));
        }
        for (key, value) in [
            ("inverter_poll_delay_secs", devices.inverter_poll_delay_secs),
            ("meter_poll_interval_secs", devices.meter_poll_interval_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SunSrvError::config(format!(
                    "devices.{key} must be zero or positive, got {value}"
                )));
            }
        }
        if devices.offline_threshold == 0 {
            return Err(SunSrvError::config("devices.offline_threshold must be at least 1"));
        }

        if self.general.poll_interval_secs == 0 {
            return Err(SunSrvError::config("general.poll_interval_secs must be at least 1"));
        }
        if self.general.status_interval_secs == 0 {
            return Err(SunSrvError::config("general.status_interval_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn tcp_config(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            host: self.modbus.host.clone(),
            port: self.modbus.port,
            timeout: secs_f64(self.modbus.timeout_secs),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            retry_attempts: self.modbus.retry_attempts,
            retry_delay: Duration::from_millis(self.modbus.retry_delay_ms),
            max_registers_per_read: self.modbus.max_registers_per_read,
            ..SessionConfig::default()
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig::default()
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_config(
            self.modbus.connect_max_attempts,
            self.modbus.connect_initial_delay_secs,
            self.modbus.connect_max_delay_secs,
        )
    }

    pub fn reconnect_period(&self) -> Duration {
        Duration::from_secs(self.modbus.reconnect_period_secs.max(1))
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            offline_threshold: self.devices.offline_threshold,
            model_verify_interval: Duration::from_secs(self.devices.model_verify_interval_secs),
            model_verify_after_failures: self.devices.model_verify_after_failures,
            ..MonitorConfig::default()
        }
    }

    pub fn sleep_config(&self) -> SleepConfig {
        SleepConfig {
            night_mode_enabled: self.modbus.night_mode_enabled,
            night_start_hour: self.modbus.night_start_hour,
            night_end_hour: self.modbus.night_end_hour,
            consecutive_failures_for_sleep: self.modbus.consecutive_failures_for_sleep,
            normal_interval: Duration::from_secs(self.general.poll_interval_secs),
            sleep_interval: Duration::from_secs(self.modbus.night_poll_interval_secs),
        }
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.modbus.ping_timeout_secs.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.general.status_interval_secs)
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            inverters: self.devices.inverters.clone(),
            meters: self.devices.meters.clone(),
            inverter_poll_delay: secs_f64(self.devices.inverter_poll_delay_secs),
            meter_poll_delay: secs_f64(self.devices.meter_poll_interval_secs),
            read_delay: Duration::from_millis(self.devices.inverter_read_delay_ms),
            controls_interval: Duration::from_secs(self.devices.controls_poll_interval_secs),
            ..PollerConfig::default()
        }
    }
}
