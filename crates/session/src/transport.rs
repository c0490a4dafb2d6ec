//! Capability interfaces the session engine needs from a device library
//!
//! Sessions are composed from these traits instead of being specialised per
//! device kind: a polling session needs [`Transport`] + [`PollingIo`], an
//! event-driven session needs [`AsyncTransport`], and the synchronous USB
//! helpers need [`UsbIo`].

use crate::error::TransportError;
use common::{
    BackendEvent, DeviceDescriptor, TargetIdentity, TransferId, TransferKind, TransferRequest,
};
use std::sync::Arc;
use std::time::Duration;

/// Receiver of events posted by a backend
///
/// Implemented by the session core: posting only queues the event and wakes
/// the session's reader thread, so it is safe to call from a backend's event
/// thread.
pub trait EventPoster: Send + Sync {
    fn post(&self, event: BackendEvent);
}

/// An open device reference
///
/// Dropping the last reference closes the device.
pub trait OpenDevice: Send + Sync + 'static {
    /// Descriptor of the device this handle was opened from
    fn descriptor(&self) -> &DeviceDescriptor;
}

/// Enumerate and open devices of one transport kind
pub trait Transport: Send + Sync + 'static {
    type Handle: OpenDevice;

    /// Every device currently visible to the transport
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open the device named by `identity`
    fn open(&self, identity: &TargetIdentity) -> Result<Self::Handle, TransportError>;
}

/// Blocking report-style I/O used by the polling reader (HID-like devices)
pub trait PollingIo: OpenDevice {
    /// Read one report, waiting at most `timeout`
    ///
    /// `Ok(0)` means nothing arrived in time. Any error means the device is
    /// gone.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    fn send_feature_report(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Read a feature report; `buf[0]` carries the report ID on entry
    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// USB control request setup fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    /// Bit 7 of bmRequestType set means device-to-host
    pub fn is_in(&self) -> bool {
        (self.request_type & 0x80) != 0
    }
}

/// Blocking endpoint I/O used by the synchronous USB variants
pub trait UsbIo: OpenDevice {
    fn read(
        &self,
        kind: TransferKind,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn write(
        &self,
        kind: TransferKind,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn read_control(
        &self,
        request: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn write_control(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;
}

/// Asynchronous transfers plus an event loop (USB-like devices)
pub trait AsyncTransport: Transport {
    /// Keeps a hotplug callback registered until dropped
    type Registration: Send + 'static;

    /// Accept a transfer for asynchronous completion
    ///
    /// `Ok` means "accepted", not "delivered". The completion is posted to
    /// `poster` as [`BackendEvent::Transfer`], from whichever thread drives
    /// [`AsyncTransport::pump_events`].
    fn submit(
        &self,
        handle: &Arc<Self::Handle>,
        request: TransferRequest,
        poster: Arc<dyn EventPoster>,
    ) -> Result<(), TransportError>;

    /// Cancel a pending transfer; its completion is posted with
    /// `TransferStatus::Cancelled`. Unknown IDs are ignored.
    fn cancel(&self, handle: &Arc<Self::Handle>, id: TransferId);

    /// Process pending events for at most `slice`
    fn pump_events(&self, slice: Duration) -> Result<(), TransportError>;

    /// Register attach/detach callbacks for `identity`
    ///
    /// Returns [`TransportError::Unsupported`] when the platform has no
    /// hotplug capability.
    fn register_hotplug(
        &self,
        identity: &TargetIdentity,
        poster: Arc<dyn EventPoster>,
    ) -> Result<Self::Registration, TransportError>;
}
