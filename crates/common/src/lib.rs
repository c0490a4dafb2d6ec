//! Common utilities for device-session
//!
//! This crate provides shared functionality between the session engine and
//! the CLI, including device identity types, error handling, logging setup,
//! and the message types that flow between transport backends, session reader
//! threads and async consumers.

pub mod channel;
pub mod device_types;
pub mod error;
pub mod logging;

pub use channel::{
    BackendEvent, Completion, EventSink, EventStream, HotplugEvent, SessionEvent, TransferId,
    TransferKind, TransferRequest, TransferStatus, create_event_stream,
};
pub use device_types::{DeviceDescriptor, DeviceFilter, TargetIdentity};
pub use error::{Error, Result};
pub use logging::setup_logging;
