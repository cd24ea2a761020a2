//! Poll loop
//!
//! One loop drives every configured unit sequentially over the shared
//! session. The session lock is held for all reads of one device, so reads
//! for different units never interleave on the wire.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::monitor::RuntimeMonitor;
use super::sleep::SleepController;
use super::SharedSession;
use crate::core::transport::ModbusSession;
use crate::device::{Device, DeviceCache, ModelResolver};
use crate::error::{Result, SunSrvError};
use crate::sink::MeasurementSink;
use crate::sunspec::decoder::{decode, decode_controls, decode_mppt, decode_storage};
use crate::sunspec::models::{
    mppt_block_len, ModelLayout, CONTROLS_LEN, CONTROLS_MODEL, CONTROLS_START, MAIN_BLOCK_START,
    MPPT_START, STORAGE_LEN, STORAGE_START,
};
use crate::sunspec::{DeviceType, Fields, Measurement, MpptString};

type DeviceKey = (DeviceType, u8);

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub inverters: Vec<u8>,
    pub meters: Vec<u8>,
    /// Pause after each inverter
    pub inverter_poll_delay: Duration,
    /// Pause after each meter
    pub meter_poll_delay: Duration,
    /// Pause between the blocks of one inverter
    pub read_delay: Duration,
    /// Minimum spacing of Model 123 reads per inverter
    pub controls_interval: Duration,
    /// Pause between reconnect and a Model 123 read
    pub controls_settle: Duration,
    /// Attempts for Model 123 and MPPT blocks
    pub extra_block_attempts: u32,
    pub extra_block_retry_delay: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            inverters: vec![1],
            meters: vec![240],
            inverter_poll_delay: Duration::from_secs(1),
            meter_poll_delay: Duration::from_secs(2),
            read_delay: Duration::from_millis(200),
            controls_interval: Duration::from_secs(60),
            controls_settle: Duration::from_millis(500),
            extra_block_attempts: 3,
            extra_block_retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct ControlsEntry {
    read_at: Instant,
    fields: Option<Fields>,
}

/// Outcome counters of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
}

pub struct Poller {
    config: PollerConfig,
    session: SharedSession,
    resolver: ModelResolver,
    cache: DeviceCache,
    monitor: Arc<RuntimeMonitor>,
    sleep: Arc<SleepController>,
    sink: Arc<dyn MeasurementSink>,
    devices: BTreeMap<DeviceKey, Device>,
    controls: HashMap<u8, ControlsEntry>,
}

/// Sleep unless cancelled; false when the token fired
async fn wait(token: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PollerConfig,
        session: SharedSession,
        resolver: ModelResolver,
        cache: DeviceCache,
        monitor: Arc<RuntimeMonitor>,
        sleep: Arc<SleepController>,
        sink: Arc<dyn MeasurementSink>,
    ) -> Self {
        for unit_id in &config.inverters {
            monitor.register(DeviceType::Inverter, *unit_id);
        }
        for unit_id in &config.meters {
            monitor.register(DeviceType::Meter, *unit_id);
        }
        Self {
            config,
            session,
            resolver,
            cache,
            monitor,
            sleep,
            sink,
            devices: BTreeMap::new(),
            controls: HashMap::new(),
        }
    }

    pub fn device(&self, device_type: DeviceType, unit_id: u8) -> Option<&Device> {
        self.devices.get(&(device_type, unit_id))
    }

    fn schedule(&self) -> Vec<(DeviceKey, Duration)> {
        let inverters = self
            .config
            .inverters
            .iter()
            .map(|id| ((DeviceType::Inverter, *id), self.config.inverter_poll_delay));
        let meters = self
            .config
            .meters
            .iter()
            .map(|id| ((DeviceType::Meter, *id), self.config.meter_poll_delay));
        inverters.chain(meters).collect()
    }

    /// Poll until the token is cancelled, then close the session
    pub async fn run(&mut self, token: CancellationToken) {
        info!(
            "Polling inverters {:?}, meters {:?}",
            self.config.inverters, self.config.meters
        );

        while !token.is_cancelled() {
            let summary = self.run_cycle(&token).await;
            if token.is_cancelled() {
                break;
            }

            let streak = self.monitor.failed_cycles();
            if summary.attempted > 0 && summary.succeeded == 0 {
                debug!("Poll cycle failed ({streak} consecutive)");
            }
            self.sleep.evaluate_now(streak).await;

            if !wait(&token, self.sleep.poll_interval()).await {
                break;
            }
        }

        self.session.lock().await.disconnect().await;
        info!("Poller stopped");
    }

    /// One pass over all configured devices
    pub async fn run_cycle(&mut self, token: &CancellationToken) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let mut link_down = !self.ensure_connected().await;

        for ((device_type, unit_id), delay) in self.schedule() {
            if token.is_cancelled() {
                break;
            }

            if let Some(remaining) = self.monitor.backoff_remaining(device_type, unit_id) {
                debug!(unit_id, "{device_type} in backoff for {:?}", remaining);
                summary.skipped += 1;
                continue;
            }

            summary.attempted += 1;
            if link_down {
                self.monitor.record_failure(device_type, unit_id);
                continue;
            }

            match self.poll_device(device_type, unit_id).await {
                Ok(measurement) => {
                    summary.succeeded += 1;
                    self.monitor
                        .record_success(device_type, unit_id, measurement.model_id);
                    self.sink.publish(&measurement).await;
                },
                Err(e) => {
                    if e.is_connection() {
                        link_down = true;
                    }
                    self.handle_failure(device_type, unit_id, e).await;
                },
            }

            if !link_down && !wait(token, delay).await {
                break;
            }
        }

        self.monitor
            .record_cycle(summary.attempted, summary.succeeded);
        summary
    }

    async fn ensure_connected(&self) -> bool {
        let mut session = self.session.lock().await;
        if session.is_connected() {
            return true;
        }
        match session.connect().await {
            Ok(()) => {
                info!("Modbus session connected");
                true
            },
            Err(e) => {
                debug!("Modbus host unavailable: {e}");
                false
            },
        }
    }

    async fn handle_failure(&mut self, device_type: DeviceType, unit_id: u8, error: SunSrvError) {
        match &error {
            SunSrvError::InvalidModel { model_id, .. } => {
                warn!(unit_id, "{device_type} reports unsupported model {model_id}")
            },
            SunSrvError::Decode(_) => warn!(unit_id, "{device_type} block rejected: {error}"),
            _ => debug!(unit_id, "{device_type} poll failed: {error}"),
        }

        let outcome = self.monitor.record_failure(device_type, unit_id);
        if outcome.reverify && self.devices.contains_key(&(device_type, unit_id)) {
            let session = Arc::clone(&self.session);
            let mut session = session.lock().await;
            self.reverify(&mut session, (device_type, unit_id), "consecutive errors")
                .await;
        }
    }

    /// Discover if needed, then read and decode one device
    async fn poll_device(&mut self, device_type: DeviceType, unit_id: u8) -> Result<Measurement> {
        let key = (device_type, unit_id);
        let session = Arc::clone(&self.session);
        let mut session = session.lock().await;

        if !self.devices.contains_key(&key) {
            let cached = self.cache.get(unit_id).cloned();
            let device = self
                .resolver
                .discover(&mut session, unit_id, device_type, cached.as_ref())
                .await?;
            self.persist(&device).await;
            self.monitor
                .mark_model_checked(device_type, unit_id, Some(device.model_id));
            self.devices.insert(key, device);
        } else if self.monitor.model_check_due(device_type, unit_id) {
            self.reverify(&mut session, key, "periodic check").await;
        }

        let device = self
            .devices
            .get(&key)
            .cloned()
            .ok_or_else(|| SunSrvError::decode(format!("unit {unit_id} not discovered")))?;
        let layout = ModelLayout::for_model(device.model_id).ok_or(SunSrvError::InvalidModel {
            unit_id,
            model_id: device.model_id,
        })?;

        let regs = session
            .read_block(unit_id, MAIN_BLOCK_START, layout.block_len())
            .await?;
        let readings = decode(device.model_id, &regs)?;
        let mut measurement =
            Measurement::new(unit_id, device_type, device.model_id, Utc::now(), readings);

        if device_type == DeviceType::Inverter {
            let strings = if device.mppt_string_count > 0 {
                self.read_mppt(&mut session, unit_id, device.mppt_string_count)
                    .await
            } else {
                Vec::new()
            };
            let controls = self.read_controls(&mut session, unit_id).await;
            let storage = if device.has_storage {
                self.read_storage(&mut session, unit_id).await
            } else {
                None
            };
            measurement = measurement
                .with_storage(storage)
                .with_strings(strings)
                .with_controls(controls);
        }

        Ok(measurement)
    }

    async fn read_storage(&self, session: &mut ModbusSession, unit_id: u8) -> Option<Fields> {
        tokio::time::sleep(self.config.read_delay).await;
        let result = match session.read_block(unit_id, STORAGE_START, STORAGE_LEN).await {
            Ok(regs) => decode_storage(&regs),
            Err(e) => Err(e),
        };
        match result {
            Ok(fields) => Some(fields),
            Err(e) => {
                debug!(unit_id, "Storage block unavailable: {e}");
                None
            },
        }
    }

    /// Model 160 after a fresh connection; the main block read leaves residue in the device buffer
    async fn read_mppt(&self, session: &mut ModbusSession, unit_id: u8, strings: u16) -> Vec<MpptString> {
        let Some(len) = mppt_block_len(strings) else {
            warn!(unit_id, "Ignoring MPPT module count {strings}");
            return Vec::new();
        };
        let attempts = self.config.extra_block_attempts.max(1);
        for attempt in 1..=attempts {
            let delay = if attempt == 1 {
                self.config.read_delay
            } else {
                self.config.extra_block_retry_delay
            };
            tokio::time::sleep(delay).await;

            if let Err(e) = session.force_reconnect().await {
                debug!(unit_id, "Reconnect before MPPT read failed: {e}");
                break;
            }

            let result = match session.read_block(unit_id, MPPT_START, len).await {
                Ok(regs) => decode_mppt(&regs, strings),
                Err(e) => Err(e),
            };
            match result {
                Ok(decoded) => return decoded,
                Err(e) => debug!(unit_id, attempt, "MPPT block not usable: {e}"),
            }
        }
        Vec::new()
    }

    /// Model 123, throttled per inverter; the last good value is re-attached between reads
    async fn read_controls(&mut self, session: &mut ModbusSession, unit_id: u8) -> Option<Fields> {
        let due = self
            .controls
            .get(&unit_id)
            .map_or(true, |entry| entry.read_at.elapsed() >= self.config.controls_interval);
        if !due {
            return self.controls.get(&unit_id).and_then(|e| e.fields.clone());
        }

        let mut fresh = None;
        let attempts = self.config.extra_block_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.extra_block_retry_delay).await;
            }
            if let Err(e) = session.force_reconnect().await {
                debug!(unit_id, "Reconnect before controls read failed: {e}");
                break;
            }
            tokio::time::sleep(self.config.controls_settle).await;

            match session.read_block(unit_id, CONTROLS_START, CONTROLS_LEN).await {
                Ok(regs) if regs[0] != CONTROLS_MODEL => {
                    debug!(unit_id, attempt, "Controls header reads {}, retrying", regs[0]);
                },
                Ok(regs) => match decode_controls(&regs) {
                    Ok(fields) => {
                        fresh = Some(fields);
                        break;
                    },
                    Err(e) => debug!(unit_id, "Controls block rejected: {e}"),
                },
                Err(e) => debug!(unit_id, attempt, "Controls read failed: {e}"),
            }
        }

        let entry = self.controls.entry(unit_id).or_insert(ControlsEntry {
            read_at: Instant::now(),
            fields: None,
        });
        entry.read_at = Instant::now();
        if fresh.is_some() {
            entry.fields = fresh;
        }
        entry.fields.clone()
    }

    async fn reverify(&mut self, session: &mut ModbusSession, key: DeviceKey, reason: &str) {
        let (device_type, unit_id) = key;
        let Some(device) = self.devices.get_mut(&key) else {
            return;
        };
        debug!(unit_id, "Reverifying {device_type} model ({reason})");

        match self.resolver.reverify(session, device).await {
            Ok(Some(change)) => {
                let device = device.clone();
                self.monitor
                    .mark_model_checked(device_type, unit_id, Some(change.current));
                self.controls.remove(&unit_id);
                self.persist(&device).await;
                self.sink.model_changed(&change).await;
            },
            Ok(None) => {
                self.monitor.mark_model_checked(device_type, unit_id, None);
            },
            Err(e) => {
                warn!(unit_id, "{device_type} model reverification failed ({reason}): {e}");
                self.monitor.mark_model_checked(device_type, unit_id, None);
            },
        }
    }

    async fn persist(&mut self, device: &Device) {
        if let Err(e) = self.cache.save(device.to_record()).await {
            warn!(unit_id = device.unit_id, "Device cache not updated: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::mock::MockTransport;
    use crate::core::transport::SessionConfig;
    use crate::device::ResolverConfig;
    use crate::runtime::monitor::MonitorConfig;
    use crate::runtime::sleep::SleepConfig;
    use crate::sink::MemorySink;
    use tempfile::TempDir;

    fn meter_block() -> Vec<u16> {
        let mut regs = vec![0u16; 53];
        regs[16] = 1500;
        regs[31] = 9650;
        regs
    }

    struct Harness {
        mock: MockTransport,
        sink: MemorySink,
        monitor: Arc<RuntimeMonitor>,
        poller: Poller,
        _dir: TempDir,
    }

    fn harness(inverters: Vec<u8>, meters: Vec<u8>) -> Harness {
        let dir = TempDir::new().unwrap();
        let mock = MockTransport::new();
        let session = ModbusSession::new(
            Box::new(mock.clone()),
            SessionConfig {
                retry_attempts: 1,
                retry_delay: Duration::ZERO,
                unit_switch_pause: Duration::ZERO,
                ..SessionConfig::default()
            },
        );
        let sink = MemorySink::new();
        let monitor = Arc::new(RuntimeMonitor::new(MonitorConfig::default()));
        let poller = Poller::new(
            PollerConfig {
                inverters,
                meters,
                inverter_poll_delay: Duration::ZERO,
                meter_poll_delay: Duration::ZERO,
                read_delay: Duration::ZERO,
                controls_settle: Duration::ZERO,
                extra_block_retry_delay: Duration::ZERO,
                ..PollerConfig::default()
            },
            Arc::new(tokio::sync::Mutex::new(session)),
            ModelResolver::new(ResolverConfig {
                attempts: 3,
                settle_delay: Duration::ZERO,
            }),
            DeviceCache::empty(dir.path().join("device_cache.json")),
            Arc::clone(&monitor),
            Arc::new(SleepController::new(SleepConfig::default(), None)),
            Arc::new(sink.clone()),
        );
        Harness {
            mock,
            sink,
            monitor,
            poller,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_meter_cycle_publishes_measurement() {
        let mut h = harness(vec![], vec![240]);
        h.mock.set_block(240, 40070, &[203]);
        h.mock.set_block(240, MAIN_BLOCK_START, &meter_block());

        let summary = h.poller.run_cycle(&CancellationToken::new()).await;
        assert_eq!(summary.succeeded, 1);

        let measurements = h.sink.measurements();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].model_id, 203);
        assert_eq!(measurements[0].fields.f64("pf_avg"), Some(0.965));
        assert_eq!(
            h.monitor.aggregate(DeviceType::Meter),
            Some(crate::runtime::AggregateStatus::Online)
        );
    }

    #[tokio::test]
    async fn test_invalid_model_emits_nothing() {
        let mut h = harness(vec![], vec![240]);
        h.mock.set_block(240, 40070, &[0x5365]);
        h.mock.set_block(240, MAIN_BLOCK_START, &meter_block());

        let summary = h.poller.run_cycle(&CancellationToken::new()).await;
        assert_eq!(summary.succeeded, 0);
        assert!(h.sink.measurements().is_empty());
        assert!(h.poller.device(DeviceType::Meter, 240).is_none());
    }

    #[tokio::test]
    async fn test_one_failing_device_does_not_block_others() {
        let mut h = harness(vec![1], vec![240]);
        h.mock.set_unit_offline(1, true);
        h.mock.set_block(240, 40070, &[203]);
        h.mock.set_block(240, MAIN_BLOCK_START, &meter_block());

        let summary = h.poller.run_cycle(&CancellationToken::new()).await;
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(h.sink.measurements()[0].unit_id, 240);
        assert_eq!(
            h.monitor
                .state(DeviceType::Inverter, 1)
                .unwrap()
                .cumulative_read_errors,
            1
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_every_device() {
        let mut h = harness(vec![1], vec![240]);
        h.mock.set_connection_failure(true);

        let summary = h.poller.run_cycle(&CancellationToken::new()).await;
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(h.monitor.failed_cycles(), 1);
        // One connect attempt for the whole cycle
        assert_eq!(h.mock.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_starts_no_reads() {
        let mut h = harness(vec![1], vec![240]);
        let token = CancellationToken::new();
        token.cancel();

        let summary = h.poller.run_cycle(&token).await;
        assert_eq!(summary.attempted, 0);
        assert_eq!(h.mock.reads_for(1) + h.mock.reads_for(240), 0);
    }
}
