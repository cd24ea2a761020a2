//! SunSpec model identifiers and the Fronius register map
//!
//! Register numbers are the 1-based values printed in the Fronius Modbus
//! documentation; the transport converts them to wire addresses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// "SunS" marker at the start of the common block
pub const SUNSPEC_MARKER: [u16; 2] = [0x5375, 0x6E53];

/// Common block (Model 1), marker included
pub const COMMON_BLOCK_START: u16 = 40001;
pub const COMMON_BLOCK_LEN: u16 = 69;

/// Model id register of the first device model
pub const MODEL_ID_REGISTER: u16 = 40070;

/// First data register of the device model
pub const MAIN_BLOCK_START: u16 = 40072;

/// Integer + scale factor inverter models
pub const INVERTER_INT_MODELS: [u16; 3] = [101, 102, 103];
pub const INVERTER_INT_LEN: u16 = 50;

/// Float inverter models
pub const INVERTER_FLOAT_MODELS: [u16; 3] = [111, 112, 113];
pub const INVERTER_FLOAT_LEN: u16 = 60;

/// Integer + scale factor meter models
pub const METER_MODELS: [u16; 4] = [201, 202, 203, 204];
pub const METER_LEN: u16 = 53;

/// Immediate controls (Model 123), header included
pub const CONTROLS_MODEL: u16 = 123;
pub const CONTROLS_START: u16 = 40228;
pub const CONTROLS_LEN: u16 = 26;

/// Storage (Model 124)
pub const STORAGE_MODEL: u16 = 124;
pub const STORAGE_HEADER_START: u16 = 40341;
pub const STORAGE_START: u16 = 40343;
pub const STORAGE_LEN: u16 = 24;

/// Multiple MPPT extension (Model 160), header included
pub const MPPT_MODEL: u16 = 160;
pub const MPPT_START: u16 = 40254;
pub const MPPT_HEADER_LEN: u16 = 10;
pub const MPPT_MODULE_LEN: u16 = 20;
/// Largest module count accepted from a Model 160 header
pub const MPPT_MAX_MODULES: u16 = 16;

/// SunSpec operating state FAULT
pub const STATUS_FAULT: u16 = 7;

/// Operating states in which the inverter feeds power
pub const ACTIVE_STATUS_CODES: [u16; 2] = [4, 5];

/// Device class polled by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Inverter,
    Meter,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inverter => "inverter",
            Self::Meter => "meter",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Register layout family of a device model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelLayout {
    InverterIntSf,
    InverterFloat,
    Meter,
}

impl ModelLayout {
    pub fn for_model(model_id: u16) -> Option<Self> {
        if INVERTER_INT_MODELS.contains(&model_id) {
            Some(Self::InverterIntSf)
        } else if INVERTER_FLOAT_MODELS.contains(&model_id) {
            Some(Self::InverterFloat)
        } else if METER_MODELS.contains(&model_id) {
            Some(Self::Meter)
        } else {
            None
        }
    }

    /// Registers read from [`MAIN_BLOCK_START`]
    pub fn block_len(&self) -> u16 {
        match self {
            Self::InverterIntSf => INVERTER_INT_LEN,
            Self::InverterFloat => INVERTER_FLOAT_LEN,
            Self::Meter => METER_LEN,
        }
    }

    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::InverterIntSf | Self::InverterFloat => DeviceType::Inverter,
            Self::Meter => DeviceType::Meter,
        }
    }
}

/// Whether a model id belongs to the supported inverter or meter set
pub fn is_supported_model(model_id: u16) -> bool {
    ModelLayout::for_model(model_id).is_some()
}

/// Registers covering the Model 160 header plus `string_count` modules, `None` on overflow
pub fn mppt_block_len(string_count: u16) -> Option<u16> {
    MPPT_MODULE_LEN
        .checked_mul(string_count)?
        .checked_add(MPPT_HEADER_LEN)
}
