//! Device session engine
//!
//! Keeps a long-lived connection to one HID or USB device: a background
//! reader delivers inbound data to user callbacks, writes go out on demand,
//! and a lost device is reopened transparently until the session is stopped.
//!
//! Two session flavours share one state machine ([`state`]):
//!
//! - [`PollingSession`]: a single thread doing blocking, time-bounded reads
//!   (hidapi style)
//! - [`EventSession`]: asynchronous transfers completed by a backend event
//!   pump and handled by the session's reader thread (libusb style)
//!
//! Sessions are generic over the capability traits in [`transport`]; the
//! hidapi and rusb implementations live in [`hid`] and [`usb`], and
//! [`test_utils`] provides scriptable in-memory ones.

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
#[cfg(feature = "hid")]
pub mod hid;
pub mod polling;
pub mod state;
pub mod test_utils;
pub mod transport;
pub mod usb;

pub use config::{BackoffConfig, SessionConfig};
pub use error::{Result, SessionError, TransportError};
#[cfg(feature = "hid")]
pub use hid::{HidHandle, HidTransport};
pub use polling::PollingSession;
pub use state::SessionState;
pub use transport::{AsyncTransport, ControlRequest, OpenDevice, PollingIo, Transport, UsbIo};
pub use usb::{EventSession, RusbTransport, SyncUsbDevice, UsbHandle};
