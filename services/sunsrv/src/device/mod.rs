//! Discovered devices, model resolution and the persisted device cache

pub mod cache;
pub mod resolver;

use serde::{Deserialize, Serialize};

use crate::sunspec::{DeviceIdentity, DeviceType};

pub use cache::{CachedDeviceRecord, DeviceCache};
pub use resolver::{ModelChange, ModelResolver, ResolverConfig};

/// A unit whose model has passed validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub unit_id: u8,
    pub device_type: DeviceType,
    pub model_id: u16,
    pub identity: DeviceIdentity,
    /// Zero when Model 160 is absent
    pub mppt_string_count: u16,
    pub has_storage: bool,
    /// Set while the last reverification returned garbage
    pub stale: bool,
}

impl Device {
    pub fn new(unit_id: u8, device_type: DeviceType, model_id: u16) -> Self {
        Self {
            unit_id,
            device_type,
            model_id,
            identity: DeviceIdentity::default(),
            mppt_string_count: 0,
            has_storage: false,
            stale: false,
        }
    }

    pub fn serial_number(&self) -> &str {
        &self.identity.serial_number
    }

    /// Persistable subset of this device
    pub fn to_record(&self) -> CachedDeviceRecord {
        CachedDeviceRecord {
            unit_id: self.unit_id,
            device_type: self.device_type,
            model_id: self.model_id,
            serial_number: self.identity.serial_number.clone(),
            mppt_string_count: self.mppt_string_count,
            has_storage: self.has_storage,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} (model {}",
            self.device_type, self.unit_id, self.model_id
        )?;
        if !self.identity.model.is_empty() {
            write!(f, ", {}", self.identity.model)?;
        }
        if self.mppt_string_count > 0 {
            write!(f, ", {} MPPT", self.mppt_string_count)?;
        }
        if self.has_storage {
            f.write_str(", storage")?;
        }
        f.write_str(")")
    }
}
