//! SunSpec register map, scaling rules and block decoders

pub mod decoder;
pub mod events;
pub mod measurement;
pub mod models;
pub mod scale;

pub use decoder::{decode, decode_common_block, decode_mppt, DeviceIdentity};
pub use events::{EventClass, EventRecord};
pub use measurement::{FieldValue, Fields, Measurement, MpptString, Readings};
pub use models::{DeviceType, ModelLayout};
