//! USB device handle
//!
//! Wraps an open `rusb::DeviceHandle` together with the descriptor it was
//! opened from and the interface claimed on it. The interface is released
//! when the handle is dropped, which is the only place a USB device closes.

use crate::error::TransportError;
use crate::transport::{ControlRequest, OpenDevice, UsbIo};
use common::{DeviceDescriptor, TargetIdentity, TransferKind};
use rusb::{Context, Device, DeviceHandle, Direction, UsbContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Open USB device with one claimed interface
pub struct UsbHandle {
    handle: DeviceHandle<Context>,
    descriptor: DeviceDescriptor,
    interface: u8,
    /// Keeps the shared libusb context alive while the device is open
    _context: Arc<Context>,
}

impl UsbHandle {
    /// Find the device matching `identity` and claim its data interface
    ///
    /// Kernel drivers bound to the interface are detached first.
    pub(crate) fn open(
        context: &Arc<Context>,
        identity: &TargetIdentity,
    ) -> Result<Self, TransportError> {
        let devices = context.devices().map_err(map_rusb_error)?;
        let device = devices
            .iter()
            .find(|device| {
                device.device_descriptor().is_ok_and(|desc| {
                    desc.vendor_id() == identity.vendor_id
                        && desc.product_id() == identity.product_id
                })
            })
            .ok_or(TransportError::NotFound)?;

        let endpoints = find_endpoints(&device).ok_or_else(|| {
            TransportError::Other(format!("No data endpoints on device {}", identity))
        })?;

        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", identity, e);
            map_rusb_error(e)
        })?;

        let interface = endpoints.interface;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                if let Err(e) = handle.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface, e);
            map_rusb_error(e)
        })?;
        debug!("Claimed interface {} on {}", interface, identity);

        let descriptor = describe(&device, Some(&handle))
            .unwrap_or_else(|| DeviceDescriptor::new(identity.vendor_id, identity.product_id))
            .with_endpoints(endpoints.input, endpoints.output);

        Ok(Self {
            handle,
            descriptor: DeviceDescriptor {
                interface: Some(interface),
                ..descriptor
            },
            interface,
            _context: Arc::clone(context),
        })
    }

    /// Bulk or interrupt OUT endpoint, if the device has one
    pub fn out_endpoint(&self) -> Option<u8> {
        self.descriptor.out_endpoint
    }
}

impl Drop for UsbHandle {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            debug!("Failed to release interface {}: {}", self.interface, e);
        }
        debug!(
            "Closed USB device {:04x}:{:04x}",
            self.descriptor.vendor_id, self.descriptor.product_id
        );
    }
}

impl OpenDevice for UsbHandle {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

impl UsbIo for UsbHandle {
    fn read(
        &self,
        kind: TransferKind,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        match kind {
            TransferKind::Bulk => self.handle.read_bulk(endpoint, buf, timeout),
            TransferKind::Interrupt => self.handle.read_interrupt(endpoint, buf, timeout),
        }
        .map_err(map_rusb_error)
    }

    fn write(
        &self,
        kind: TransferKind,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        match kind {
            TransferKind::Bulk => self.handle.write_bulk(endpoint, data, timeout),
            TransferKind::Interrupt => self.handle.write_interrupt(endpoint, data, timeout),
        }
        .map_err(map_rusb_error)
    }

    fn read_control(
        &self,
        request: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .read_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                buf,
                timeout,
            )
            .map_err(map_rusb_error)
    }

    fn write_control(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .write_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                data,
                timeout,
            )
            .map_err(map_rusb_error)
    }
}

/// Data endpoints of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Endpoints {
    interface: u8,
    input: Option<u8>,
    output: Option<u8>,
}

/// First interface of configuration 0 that has data endpoints
///
/// An interface with both directions wins over one with a single direction.
fn find_endpoints<T: UsbContext>(device: &Device<T>) -> Option<Endpoints> {
    let config = device.config_descriptor(0).ok()?;
    let mut fallback = None;

    for interface in config.interfaces() {
        let mut found = Endpoints {
            interface: interface.number(),
            input: None,
            output: None,
        };
        for setting in interface.descriptors() {
            for endpoint in setting.endpoint_descriptors() {
                match endpoint.direction() {
                    Direction::In => found.input = found.input.or(Some(endpoint.address())),
                    Direction::Out => found.output = found.output.or(Some(endpoint.address())),
                }
            }
        }

        if found.input.is_some() && found.output.is_some() {
            return Some(found);
        }
        if fallback.is_none() && (found.input.is_some() || found.output.is_some()) {
            fallback = Some(found);
        }
    }

    fallback
}

/// Descriptor for `device`, with string descriptors when a handle is available
pub(crate) fn describe<T: UsbContext>(
    device: &Device<T>,
    handle: Option<&DeviceHandle<T>>,
) -> Option<DeviceDescriptor> {
    let desc = device.device_descriptor().ok()?;
    let mut descriptor = DeviceDescriptor::new(desc.vendor_id(), desc.product_id());

    if let Some(endpoints) = find_endpoints(device) {
        descriptor = descriptor.with_endpoints(endpoints.input, endpoints.output);
        descriptor.interface = Some(endpoints.interface);
    }
    descriptor.path = Some(format!("{:03}:{:03}", device.bus_number(), device.address()));

    if let Some(handle) = handle {
        let read = |index: Option<u8>| {
            index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        };
        descriptor.manufacturer = read(desc.manufacturer_string_index());
        descriptor.product = read(desc.product_string_index());
        descriptor.serial_number = read(desc.serial_number_string_index());
    }

    Some(descriptor)
}

/// Map `rusb::Error` to the transport error classes the session acts on
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Pipe => TransportError::Stall,
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Access => TransportError::Access,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::NotSupported => TransportError::Unsupported,
        rusb::Error::Io => TransportError::Io(err.to_string()),
        _ => TransportError::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransportError::Stall);
        assert!(map_rusb_error(rusb::Error::Pipe).is_stall());
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransportError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), TransportError::NotFound);
        assert!(matches!(
            map_rusb_error(rusb::Error::Overflow),
            TransportError::Other(_)
        ));
    }
}
