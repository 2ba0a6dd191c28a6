//! # stackcrawl Utilities
//!
//! Logging setup shared by the stackcrawl workspace.
//!
//! The core library only emits `tracing` events; binaries call
//! [`init_logging`] once at startup to decide where those events go.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{LogFormat, LogLevel, LogSettings, LoggingError, init_logging, init_logging_with_level};
pub use tracing::{debug, error, info, trace, warn};
