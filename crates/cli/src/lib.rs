//! devsession command-line front end
//!
//! The binary lives in `main.rs`; configuration and payload parsing are
//! exposed here so they can be exercised by integration tests.

pub mod config;
pub mod hex;

pub use config::{CliConfig, DeviceKind, DeviceSettings, LoggingSettings};
