//! Publisher boundary
//!
//! MQTT and InfluxDB publishers live outside this crate and plug in through
//! [`MeasurementSink`]. The binary ships [`TracingSink`], which logs what
//! would be published.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::core::config::PublishMode;
use crate::device::ModelChange;
use crate::runtime::monitor::RuntimeSnapshot;
use crate::sunspec::{DeviceType, FieldValue, Measurement};

/// Consumer of measurements and runtime reports
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, measurement: &Measurement);

    async fn publish_runtime(&self, snapshot: &RuntimeSnapshot);

    /// One-time notice of model drift
    async fn model_changed(&self, _change: &ModelChange) {}

    fn is_connected(&self) -> bool;
}

/// Entries of `current` that are new or differ from `previous`
pub fn changed_fields(
    previous: Option<&BTreeMap<String, FieldValue>>,
    current: &BTreeMap<String, FieldValue>,
) -> BTreeMap<String, FieldValue> {
    match previous {
        None => current.clone(),
        Some(previous) => current
            .iter()
            .filter(|(key, value)| previous.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}

/// Logs measurements at debug level
///
/// In [`PublishMode::Changed`] only fields that differ from the previous
/// measurement of the same device are logged.
#[derive(Debug, Default)]
pub struct TracingSink {
    mode: PublishMode,
    last: Mutex<HashMap<(DeviceType, u8), BTreeMap<String, FieldValue>>>,
}

impl TracingSink {
    pub fn new(mode: PublishMode) -> Self {
        Self {
            mode,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Fields to emit for `measurement`, remembering it as the latest
    fn outgoing(&self, measurement: &Measurement) -> BTreeMap<String, FieldValue> {
        let flat = measurement.flatten();
        let mut last = self.last.lock();
        let key = (measurement.device_type, measurement.unit_id);
        let outgoing = match self.mode {
            PublishMode::All => flat.clone(),
            PublishMode::Changed => changed_fields(last.get(&key), &flat),
        };
        last.insert(key, flat);
        outgoing
    }
}

#[async_trait]
impl MeasurementSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn publish(&self, measurement: &Measurement) {
        let flat = self.outgoing(measurement);
        if flat.is_empty() {
            trace!(unit_id = measurement.unit_id, "No changed fields");
            return;
        }
        let fields: Vec<String> = flat.iter().map(|(k, v)| format!("{k}={v}")).collect();
        debug!(
            unit_id = measurement.unit_id,
            model_id = measurement.model_id,
            "{} {}",
            measurement.device_type,
            fields.join(" ")
        );
    }

    async fn publish_runtime(&self, snapshot: &RuntimeSnapshot) {
        for report in &snapshot.devices {
            debug!(
                unit_id = report.unit_id,
                "{} {} read_errors={} last_seen={}",
                report.device_type,
                report.status.as_str(),
                report.read_errors,
                report
                    .last_seen
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
        }
        if let Some(status) = snapshot.inverter_status {
            info!("Inverters {status}, uptime {}", snapshot.uptime);
        }
        if let Some(status) = snapshot.meter_status {
            info!("Meters {status}, uptime {}", snapshot.uptime);
        }
    }

    async fn model_changed(&self, change: &ModelChange) {
        info!(
            unit_id = change.unit_id,
            "{} model changed {} -> {}", change.device_type, change.previous, change.current
        );
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Collects everything it receives; used by tests to observe the poller
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkInner>>,
}

#[derive(Debug, Default)]
struct MemorySinkInner {
    measurements: Vec<Measurement>,
    snapshots: Vec<RuntimeSnapshot>,
    changes: Vec<ModelChange>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measurements(&self) -> Vec<Measurement> {
        self.inner.lock().measurements.clone()
    }

    pub fn snapshots(&self) -> Vec<RuntimeSnapshot> {
        self.inner.lock().snapshots.clone()
    }

    pub fn changes(&self) -> Vec<ModelChange> {
        self.inner.lock().changes.clone()
    }
}

#[async_trait]
impl MeasurementSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, measurement: &Measurement) {
        self.inner.lock().measurements.push(measurement.clone());
    }

    async fn publish_runtime(&self, snapshot: &RuntimeSnapshot) {
        self.inner.lock().snapshots.push(snapshot.clone());
    }

    async fn model_changed(&self, change: &ModelChange) {
        self.inner.lock().changes.push(*change);
    }

    fn is_connected(&self) -> bool {
        true
    }
}
