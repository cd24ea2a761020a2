//! Polling runtime: orchestration, health tracking, sleep handling and reconnection

pub mod health;
pub mod monitor;
pub mod poller;
pub mod reconnect;
pub mod sleep;
pub mod status;

use std::sync::Arc;

use crate::core::transport::ModbusSession;

/// The one Modbus session, shared by the poll loop and the background reconnect task
pub type SharedSession = Arc<tokio::sync::Mutex<ModbusSession>>;

pub use monitor::{AggregateStatus, DeviceStatus, MonitorConfig, RuntimeMonitor, RuntimeSnapshot};
pub use poller::{Poller, PollerConfig};
pub use reconnect::{connect_with_backoff, spawn_background_reconnect, ReconnectError, ReconnectPolicy};
pub use sleep::{PingProbe, ReachabilityProbe, SleepConfig, SleepController};
pub use status::StatusReporter;
