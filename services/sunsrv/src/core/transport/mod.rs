//! Transport layer
//!
//! `Transport` implementations move single FC03 exchanges; `ModbusSession`
//! layers retries, chunking and unit-switch reconnects on top.

pub mod mock;
pub mod session;
pub mod tcp;
pub mod traits;

pub use session::{ModbusSession, SessionConfig};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use traits::{Transport, TransportError, TransportStats};
