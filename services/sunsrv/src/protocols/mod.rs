//! Wire protocols spoken by the service

pub mod modbus;
