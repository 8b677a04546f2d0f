//! A3S Box Core - Foundational Types and Abstractions
//!
//! This module provides the error, configuration and build-log types shared
//! by the A3S Box build interception crates.

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::BuildProxyConfig;
pub use error::{BoxError, Result};
pub use log::BuildLogRecord;

/// A3S Box version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
