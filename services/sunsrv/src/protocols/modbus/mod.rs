//! Modbus TCP framing for holding-register reads

pub mod constants;
pub mod frame;

pub use frame::{decode_read_response, MbapHeader, ReadHoldingRequest};
