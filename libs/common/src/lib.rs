//! Process plumbing shared by the services
//!
//! - `logging`: subscriber setup with the bracketed console format and a
//!   size-rotated log file
//! - `shutdown`: SIGINT/SIGTERM wait
//! - `serde_helpers`: lenient deserializers for configuration values

pub mod logging;
pub mod serde_helpers;
pub mod shutdown;

pub use logging::{init_with_config, LogConfig, LoggingError};
pub use shutdown::{wait_for_shutdown, ShutdownSignal};
