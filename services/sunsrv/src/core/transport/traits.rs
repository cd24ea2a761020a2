//! Transport layer abstractions
//!
//! A transport moves one Modbus request/response pair at a time. Session
//! concerns (retries, unit switching, chunking) live one level up in
//! [`super::ModbusSession`].

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::SystemTime;
use thiserror::Error;

use crate::protocols::modbus::constants::exception_name;

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection establishment failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Established connection was lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation attempted without a connection
    #[error("Not connected")]
    NotConnected,

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Device answered with a Modbus exception
    #[error("Modbus exception 0x{code:02X} ({}) for function 0x{function:02X}", exception_name(*code))]
    Exception { function: u8, code: u8 },

    /// Malformed or unexpected frame
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Socket level I/O error
    #[error("I/O error: {0}")]
    IoError(String),
}

impl TransportError {
    /// Errors after which the socket can no longer be trusted
    pub fn drops_connection(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::NotConnected | Self::Timeout(_) | Self::IoError(_)
        )
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    /// Reconnects forced by a unit id switch or model id read
    pub forced_reconnects: u64,
    pub last_connected: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    pub fn record_successful_connection(&mut self) {
        self.successful_connections += 1;
        self.last_connected = Some(SystemTime::now());
    }

    pub fn record_failed_connection(&mut self, error: &str) {
        self.failed_connections += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn record_read(&mut self, ok: bool) {
        if ok {
            self.successful_reads += 1;
        } else {
            self.failed_reads += 1;
        }
    }
}

/// A byte-level Modbus TCP link to the SunSpec host
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Establish the connection
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the connection; a no-op when already closed
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Whether a connection is currently held
    fn is_connected(&self) -> bool;

    /// Issue one FC03 request and return exactly `count` registers
    ///
    /// `address` is the zero-based wire address.
    async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;
}
