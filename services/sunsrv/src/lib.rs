//! SunSpec Modbus TCP polling service for Fronius inverters and smart meters
//!
//! The crate resolves the SunSpec model of every configured unit behind a
//! Fronius DataManager, reads and decodes its register blocks on a schedule
//! and hands the resulting [`sunspec::Measurement`]s to a
//! [`sink::MeasurementSink`]. Device health, night sleep and reconnection are
//! handled in [`runtime`].

pub mod core;
pub mod device;
pub mod error;
pub mod protocols;
pub mod runtime;
pub mod sink;
pub mod sunspec;

pub use error::{Result, SunSrvError};
