//! Command line and process setup

use clap::{Parser, ValueEnum};
use common::logging::{self, LogConfig, LoggingError};
use std::path::PathBuf;

use crate::core::config::AppConfig;
use crate::runtime::PollerConfig;

pub const SERVICE_NAME: &str = "sunsrv";

/// Which configured device classes are polled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DeviceFilter {
    #[default]
    All,
    Inverter,
    Meter,
}

impl DeviceFilter {
    pub fn apply(&self, config: &mut PollerConfig) {
        match self {
            Self::All => {},
            Self::Inverter => config.meters.clear(),
            Self::Meter => config.inverters.clear(),
        }
    }
}

/// Fronius SunSpec Modbus TCP poller
#[derive(Debug, Clone, Parser)]
#[clap(author, version, about)]
pub struct Args {
    /// Configuration file (YAML)
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[clap(short = 'l', long)]
    pub log_level: Option<String>,

    /// Device classes to poll
    #[clap(short = 'd', long, value_enum, default_value_t = DeviceFilter::All)]
    pub device: DeviceFilter,

    /// Disable colored console output
    #[clap(long)]
    pub no_color: bool,

    /// Load and validate the configuration, then exit
    #[clap(long)]
    pub validate: bool,
}

impl Args {
    pub fn log_config(&self, config: &AppConfig) -> LogConfig {
        LogConfig {
            service_name: SERVICE_NAME.to_string(),
            level: self
                .log_level
                .clone()
                .unwrap_or_else(|| config.general.log_level.clone()),
            log_dir: config.general.log_dir.clone(),
            ansi: !self.no_color,
            ..LogConfig::default()
        }
    }

    pub fn init_logging(&self, config: &AppConfig) -> Result<(), LoggingError> {
        logging::init_with_config(self.log_config(config))
    }

    /// Poll schedule with the device filter applied
    pub fn poller_config(&self, config: &AppConfig) -> PollerConfig {
        let mut poller = config.poller_config();
        self.device.apply(&mut poller);
        poller
    }
}
