//! Shared fixtures for the sunsrv integration tests
//!
//! Register images follow the Fronius SunSpec map; `Harness` wires a
//! `Poller` to a `MockTransport` with all pacing delays set to zero.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use sunsrv::core::transport::mock::MockTransport;
use sunsrv::core::transport::{ModbusSession, SessionConfig};
use sunsrv::device::{DeviceCache, ModelResolver, ResolverConfig};
use sunsrv::runtime::{
    MonitorConfig, Poller, PollerConfig, RuntimeMonitor, SharedSession, SleepConfig,
    SleepController,
};
use sunsrv::sink::MemorySink;

pub const INVERTER: u8 = 1;
pub const METER: u8 = 240;

pub fn i16_reg(value: i16) -> u16 {
    value as u16
}

/// Model 103 block: 1500 W, 50.01 Hz, operating state MPPT
pub fn inverter_block() -> Vec<u16> {
    let mut regs = vec![0u16; 50];
    regs[0] = 652;
    regs[4] = i16_reg(-2);
    regs[8] = 2301;
    regs[11] = i16_reg(-1);
    regs[12] = 1500;
    regs[14] = 5001;
    regs[15] = i16_reg(-2);
    regs[20] = 9950;
    regs[36] = 4;
    regs[37] = 4;
    regs
}

/// Model 203 block with a power factor of 0.965
pub fn meter_block() -> Vec<u16> {
    let mut regs = vec![0u16; 53];
    regs[16] = 1500;
    regs[31] = 9650;
    regs
}

/// Model 124 data registers: 87.5 % state of charge, charging
pub fn storage_block() -> Vec<u16> {
    let mut regs = vec![0u16; 24];
    regs[0] = 5000;
    regs[6] = 8750;
    regs[9] = 4;
    regs[20] = i16_reg(-2);
    regs
}

/// Model 160 block with `strings` modules of 1435 W each
pub fn mppt_block(strings: u16) -> Vec<u16> {
    let mut regs = vec![0u16; (10 + 20 * strings) as usize];
    regs[0] = 160;
    regs[1] = 8 + 20 * strings;
    regs[2] = i16_reg(-2);
    regs[3] = i16_reg(-1);
    regs[8] = strings;
    for i in 0..strings as usize {
        let base = 10 + 20 * i;
        regs[base] = i as u16 + 1;
        regs[base + 9] = 410;
        regs[base + 10] = 3500;
        regs[base + 11] = 1435;
        regs[base + 16] = 0x8000;
    }
    regs
}

/// Model 123 block: connected, power limited to 100 %
pub fn controls_block() -> Vec<u16> {
    let mut regs = vec![0u16; 26];
    regs[0] = 123;
    regs[1] = 24;
    regs[4] = 1;
    regs[5] = 10000;
    regs[9] = 1;
    regs[23] = i16_reg(-2);
    regs
}

/// Register image of a Symo with battery and two MPPT trackers
pub fn load_inverter(mock: &MockTransport, unit_id: u8) {
    mock.set_block(unit_id, 40070, &[103]);
    mock.set_block(unit_id, 40072, &inverter_block());
    mock.set_block(unit_id, 40228, &controls_block());
    mock.set_block(unit_id, 40254, &mppt_block(2));
    mock.set_block(unit_id, 40341, &[124, 24]);
    mock.set_block(unit_id, 40343, &storage_block());
}

pub fn load_meter(mock: &MockTransport, unit_id: u8, model_id: u16) {
    mock.set_block(unit_id, 40070, &[model_id]);
    mock.set_block(unit_id, 40072, &meter_block());
}

pub fn fast_session(mock: &MockTransport) -> SharedSession {
    let session = ModbusSession::new(
        Box::new(mock.clone()),
        SessionConfig {
            retry_attempts: 1,
            retry_delay: Duration::ZERO,
            unit_switch_pause: Duration::ZERO,
            ..SessionConfig::default()
        },
    );
    Arc::new(tokio::sync::Mutex::new(session))
}

pub fn fast_poller_config(inverters: Vec<u8>, meters: Vec<u8>) -> PollerConfig {
    PollerConfig {
        inverters,
        meters,
        inverter_poll_delay: Duration::ZERO,
        meter_poll_delay: Duration::ZERO,
        read_delay: Duration::ZERO,
        controls_settle: Duration::ZERO,
        extra_block_retry_delay: Duration::ZERO,
        ..PollerConfig::default()
    }
}

pub fn day_sleep_config() -> SleepConfig {
    SleepConfig {
        night_mode_enabled: false,
        ..SleepConfig::default()
    }
}

pub struct Harness {
    pub mock: MockTransport,
    pub sink: MemorySink,
    pub monitor: Arc<RuntimeMonitor>,
    pub session: SharedSession,
    pub poller: Poller,
    pub cache_path: PathBuf,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(inverters: Vec<u8>, meters: Vec<u8>) -> Self {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("device_cache.json");
        Self::with_cache(inverters, meters, dir, DeviceCache::empty(&cache_path))
    }

    pub fn with_cache(inverters: Vec<u8>, meters: Vec<u8>, dir: TempDir, cache: DeviceCache) -> Self {
        let cache_path = cache.path().to_path_buf();
        let mock = MockTransport::new();
        let session = fast_session(&mock);
        let sink = MemorySink::new();
        let monitor = Arc::new(RuntimeMonitor::new(MonitorConfig::default()));
        let poller = Poller::new(
            fast_poller_config(inverters, meters),
            Arc::clone(&session),
            ModelResolver::new(ResolverConfig {
                attempts: 3,
                settle_delay: Duration::ZERO,
            }),
            cache,
            Arc::clone(&monitor),
            Arc::new(SleepController::new(day_sleep_config(), None)),
            Arc::new(sink.clone()),
        );
        Self {
            mock,
            sink,
            monitor,
            session,
            poller,
            cache_path,
            dir,
        }
    }
}
