//! USB subsystem
//!
//! - [`device`]: open devices, claim interfaces, blocking endpoint I/O
//! - [`transfers`]: synchronous transfers with stall retry
//! - [`backend`]: libusb backend for event-driven sessions, hot-plug
//! - `queue`: waiting/in-service bookkeeping behind the backend's transfers
//! - [`pump`]: the per-session event pump thread
//! - [`session`]: the event-driven session itself

pub mod backend;
pub mod device;
pub mod pump;
mod queue;
pub mod session;
pub mod transfers;

pub use backend::RusbTransport;
pub use device::{UsbHandle, map_rusb_error};
pub use pump::EventPump;
pub use session::EventSession;
pub use transfers::{SyncUsbDevice, with_stall_retry};
