//! Core plumbing: configuration, bootstrap and the Modbus transport

pub mod bootstrap;
pub mod config;
pub mod transport;
