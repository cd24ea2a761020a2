//! SunSpec model resolution
//!
//! Every model id read goes through a fresh connection followed by a short
//! settle pause: the DataManager otherwise answers with bytes left over from
//! the previous unit (typically 0x5365), which looks like a model id.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::cache::CachedDeviceRecord;
use super::Device;
use crate::core::transport::ModbusSession;
use crate::error::{Result, SunSrvError};
use crate::sunspec::decoder::{decode_common_block, mppt_module_count};
use crate::sunspec::models::{
    is_supported_model, ModelLayout, COMMON_BLOCK_LEN, COMMON_BLOCK_START, MODEL_ID_REGISTER,
    MPPT_HEADER_LEN, MPPT_START, STORAGE_HEADER_START, STORAGE_MODEL,
};
use crate::sunspec::{DeviceIdentity, DeviceType};

/// Resolver pacing
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Attempts per resolution, each behind a forced reconnect
    pub attempts: u32,
    /// Pause between reconnect and the model id read
    pub settle_delay: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            settle_delay: Duration::from_millis(300),
        }
    }
}

/// Model id drift detected by reverification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelChange {
    pub unit_id: u8,
    pub device_type: DeviceType,
    pub previous: u16,
    pub current: u16,
}

#[derive(Debug, Clone, Default)]
pub struct ModelResolver {
    config: ResolverConfig,
}

impl ModelResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Reconnect, settle, then read the model id register once
    async fn read_model_id(&self, session: &mut ModbusSession, unit_id: u8) -> Result<u16> {
        session.force_reconnect().await?;
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        let regs = session.read_block(unit_id, MODEL_ID_REGISTER, 1).await?;
        Ok(regs[0])
    }

    /// Read and validate the model id of a unit
    pub async fn resolve_model(&self, session: &mut ModbusSession, unit_id: u8) -> Result<u16> {
        let attempts = self.config.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.read_model_id(session, unit_id).await {
                Ok(model_id) if is_supported_model(model_id) => {
                    debug!(unit_id, model_id, attempt, "Model id resolved");
                    return Ok(model_id);
                },
                Ok(model_id) => {
                    debug!(
                        unit_id,
                        attempt, "Ignoring invalid model id {model_id} (0x{model_id:04X})"
                    );
                    last_error = Some(SunSrvError::InvalidModel { unit_id, model_id });
                },
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => {
                    debug!(unit_id, attempt, "Model id read failed: {e}");
                    last_error = Some(e);
                },
            }
        }

        Err(last_error.unwrap_or_else(|| SunSrvError::read(unit_id, MODEL_ID_REGISTER, 1, "no attempts")))
    }

    /// Read the common block; failure leaves the identity empty
    pub async fn identify(&self, session: &mut ModbusSession, unit_id: u8) -> Option<DeviceIdentity> {
        let regs = match session
            .read_block(unit_id, COMMON_BLOCK_START, COMMON_BLOCK_LEN)
            .await
        {
            Ok(regs) => regs,
            Err(e) => {
                debug!(unit_id, "Common block unavailable: {e}");
                return None;
            },
        };
        match decode_common_block(&regs) {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!(unit_id, "Common block not decodable: {e}");
                None
            },
        }
    }

    /// Probe for Model 124 storage and Model 160 MPPT blocks
    ///
    /// Absence of either block is not an error.
    pub async fn detect_capabilities(&self, session: &mut ModbusSession, unit_id: u8) -> (bool, u16) {
        let has_storage = match session.read_block(unit_id, STORAGE_HEADER_START, 2).await {
            Ok(regs) => regs[0] == STORAGE_MODEL,
            Err(e) => {
                debug!(unit_id, "No storage model: {e}");
                false
            },
        };

        let mppt_string_count = match session.read_block(unit_id, MPPT_START, MPPT_HEADER_LEN).await {
            Ok(regs) => mppt_module_count(&regs).unwrap_or(0),
            Err(e) => {
                debug!(unit_id, "No MPPT model: {e}");
                0
            },
        };

        (has_storage, mppt_string_count)
    }

    /// Full discovery of a configured unit
    ///
    /// The model id is always re-read; a cached record with the same model
    /// id supplies the capabilities instead of probing for them again.
    pub async fn discover(
        &self,
        session: &mut ModbusSession,
        unit_id: u8,
        expected: DeviceType,
        cached: Option<&CachedDeviceRecord>,
    ) -> Result<Device> {
        let model_id = self.resolve_model(session, unit_id).await?;
        if ModelLayout::for_model(model_id).map(|l| l.device_type()) != Some(expected) {
            warn!(unit_id, model_id, "Unit configured as {expected} reports a different device class");
            return Err(SunSrvError::InvalidModel { unit_id, model_id });
        }

        let mut device = Device::new(unit_id, expected, model_id);
        if let Some(identity) = self.identify(session, unit_id).await {
            device.identity = identity;
        }

        let cached = cached.filter(|r| r.model_id == model_id && r.device_type == expected);
        match cached {
            Some(record) => {
                device.mppt_string_count = record.mppt_string_count;
                device.has_storage = record.has_storage;
                if device.identity.serial_number.is_empty() {
                    device.identity.serial_number = record.serial_number.clone();
                }
            },
            None if expected == DeviceType::Inverter => {
                let (has_storage, strings) = self.detect_capabilities(session, unit_id).await;
                device.has_storage = has_storage;
                device.mppt_string_count = strings;
            },
            None => {},
        }

        info!("Discovered {device}");
        Ok(device)
    }

    /// Re-read the model id of a known device
    ///
    /// An unsupported value keeps the current model and raises `InvalidModel`.
    /// A valid, different value updates the device and is returned as a change.
    pub async fn reverify(
        &self,
        session: &mut ModbusSession,
        device: &mut Device,
    ) -> Result<Option<ModelChange>> {
        let unit_id = device.unit_id;
        let model_id = self.read_model_id(session, unit_id).await?;

        let same_class =
            ModelLayout::for_model(model_id).map(|l| l.device_type()) == Some(device.device_type);
        if !is_supported_model(model_id) || !same_class {
            debug!(
                unit_id,
                "Reverification read model id {model_id}, keeping {}", device.model_id
            );
            device.stale = true;
            return Err(SunSrvError::InvalidModel { unit_id, model_id });
        }
        device.stale = false;

        if model_id == device.model_id {
            debug!(unit_id, model_id, "Model id verified");
            return Ok(None);
        }

        let change = ModelChange {
            unit_id,
            device_type: device.device_type,
            previous: device.model_id,
            current: model_id,
        };
        warn!(
            unit_id,
            "{} model id changed from {} to {}", device.device_type, change.previous, change.current
        );
        device.model_id = model_id;
        if device.device_type == DeviceType::Inverter {
            let (has_storage, strings) = self.detect_capabilities(session, unit_id).await;
            device.has_storage = has_storage;
            device.mppt_string_count = strings;
        }
        Ok(Some(change))
    }
}
