//! Error types for the polling service
//!
//! Every failure the poll loop can meet is represented here so it can be
//! recorded as device state instead of terminating the process.

use thiserror::Error;

use crate::core::transport::TransportError;

/// Service error taxonomy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SunSrvError {
    /// The Modbus host cannot be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// A register read failed after all retries
    #[error("Read error: unit {unit_id} registers {start}+{count}: {reason}")]
    Read {
        unit_id: u8,
        start: u16,
        count: u16,
        reason: String,
    },

    /// Model id outside the supported SunSpec set
    #[error("Invalid model: unit {unit_id} reported model id {model_id}")]
    InvalidModel { unit_id: u8, model_id: u16 },

    /// Register payload does not match the expected layout
    #[error("Decode error: {0}")]
    Decode(String),

    /// Device cache could not be read or written
    #[error("Cache error: {0}")]
    Cache(String),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local filesystem failure
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type for service operations
pub type Result<T> = std::result::Result<T, SunSrvError>;

impl SunSrvError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn read(unit_id: u8, start: u16, count: u16, reason: impl Into<String>) -> Self {
        Self::Read {
            unit_id,
            start,
            count,
            reason: reason.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True when the shared Modbus session itself is down
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<std::io::Error> for SunSrvError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SunSrvError {
    fn from(err: serde_json::Error) -> Self {
        Self::Cache(err.to_string())
    }
}

impl From<figment::Error> for SunSrvError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<TransportError> for SunSrvError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionFailed(msg) => Self::Connection(msg),
            TransportError::ConfigError(msg) => Self::Config(msg),
            other => Self::Connection(other.to_string()),
        }
    }
}
