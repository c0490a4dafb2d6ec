//! libusb backend for event-driven sessions
//!
//! rusb exposes no safe asynchronous transfer API, so submitted transfers are
//! queued here and serviced by whichever thread drives
//! [`AsyncTransport::pump_events`]: each pump slice first runs libusb's event
//! handling (which delivers hotplug callbacks), then gives every queued
//! transfer one short blocking attempt. An IN transfer that times out stays
//! queued; anything else completes and is posted to the session. The queue
//! bookkeeping itself lives in [`crate::usb::queue`].

use crate::config::SessionConfig;
use crate::context::SharedContext;
use crate::error::{Result, SessionError, TransportError};
use crate::transport::{AsyncTransport, EventPoster, Transport, UsbIo};
use crate::usb::device::{UsbHandle, describe, map_rusb_error};
use crate::usb::queue::TransferQueue;
use crate::usb::session::EventSession;
use common::{
    BackendEvent, Completion, DeviceDescriptor, HotplugEvent, TargetIdentity, TransferId,
    TransferRequest, TransferStatus,
};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

static USB_CONTEXT: SharedContext<Context> = SharedContext::new("libusb");

/// Time spent in libusb event handling and in each IN attempt per slice
const SERVICE_TICK: Duration = Duration::from_millis(10);

/// Root hubs cannot be opened as data devices
const LINUX_FOUNDATION_VID: u16 = 0x1d6b;
const HUB_CLASS: u8 = 9;

struct PendingTransfer {
    handle: Arc<UsbHandle>,
    request: TransferRequest,
    poster: Arc<dyn EventPoster>,
}

/// rusb-backed [`AsyncTransport`]
pub struct RusbTransport {
    context: Arc<Context>,
    queue: Mutex<TransferQueue<PendingTransfer>>,
}

impl RusbTransport {
    /// Join (or create) the process-wide libusb context
    pub fn new() -> Result<Self> {
        let context = USB_CONTEXT
            .acquire(Context::new)
            .map_err(|e| SessionError::ContextUnavailable(e.to_string()))?;
        Ok(Self {
            context,
            queue: Mutex::new(TransferQueue::default()),
        })
    }

    fn queue(&self) -> MutexGuard<'_, TransferQueue<PendingTransfer>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One attempt at `transfer`; `None` means it stays queued
    fn service(transfer: &mut PendingTransfer) -> Option<Completion> {
        let request = &mut transfer.request;
        let result = if request.is_in() {
            let timeout = request.timeout.min(SERVICE_TICK).max(Duration::from_millis(1));
            transfer
                .handle
                .read(request.kind, request.endpoint, &mut request.buffer, timeout)
        } else {
            transfer
                .handle
                .write(request.kind, request.endpoint, &request.buffer, request.timeout)
        };

        let (status, actual_length) = match result {
            Ok(len) => (TransferStatus::Completed, len),
            Err(TransportError::Timeout) if request.is_in() => return None,
            Err(e) => (transfer_status(e), 0),
        };
        trace!(
            "Transfer {:?} on {:#04x} finished: {:?} ({} bytes)",
            request.id, request.endpoint, status, actual_length
        );

        Some(Completion {
            request: request.clone(),
            status,
            actual_length,
        })
    }
}

impl Transport for RusbTransport {
    type Handle = UsbHandle;

    fn devices(&self) -> std::result::Result<Vec<DeviceDescriptor>, TransportError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut found = Vec::new();

        for device in devices.iter() {
            if is_root_hub(&device) {
                continue;
            }
            let handle = device.open().ok();
            if let Some(descriptor) = describe(&device, handle.as_ref()) {
                found.push(descriptor);
            }
        }

        debug!("Enumerated {} USB devices", found.len());
        Ok(found)
    }

    fn open(&self, identity: &TargetIdentity) -> std::result::Result<UsbHandle, TransportError> {
        UsbHandle::open(&self.context, identity)
    }
}

impl AsyncTransport for RusbTransport {
    type Registration = Registration<Context>;

    fn submit(
        &self,
        handle: &Arc<UsbHandle>,
        request: TransferRequest,
        poster: Arc<dyn EventPoster>,
    ) -> std::result::Result<(), TransportError> {
        if request.buffer.is_empty() {
            return Err(TransportError::Other("empty transfer buffer".to_string()));
        }
        let id = request.id;
        self.queue().push(
            id,
            PendingTransfer {
                handle: Arc::clone(handle),
                request,
                poster,
            },
        );
        Ok(())
    }

    fn cancel(&self, _handle: &Arc<UsbHandle>, id: TransferId) {
        let waiting = self.queue().cancel(id);
        if let Some(transfer) = waiting {
            post_cancelled(transfer);
        }
    }

    fn pump_events(&self, slice: Duration) -> std::result::Result<(), TransportError> {
        match self.context.handle_events(Some(slice.min(SERVICE_TICK))) {
            Ok(()) | Err(rusb::Error::Interrupted) => {}
            Err(e) => return Err(map_rusb_error(e)),
        }

        let batch = self.queue().begin();

        for (id, mut transfer) in batch {
            let completion = Self::service(&mut transfer);

            let mut queue = self.queue();
            if queue.finish(id) {
                drop(queue);
                post_cancelled(transfer);
                continue;
            }
            match completion {
                Some(completion) => {
                    drop(queue);
                    transfer
                        .poster
                        .post(BackendEvent::Transfer(completion));
                }
                None => queue.requeue(id, transfer),
            }
        }

        Ok(())
    }

    fn register_hotplug(
        &self,
        identity: &TargetIdentity,
        poster: Arc<dyn EventPoster>,
    ) -> std::result::Result<Registration<Context>, TransportError> {
        if !rusb::has_hotplug() {
            return Err(TransportError::Unsupported);
        }

        let callback = HotplugCallback {
            identity: *identity,
            poster,
        };
        let registration = HotplugBuilder::new()
            .vendor_id(identity.vendor_id)
            .product_id(identity.product_id)
            .enumerate(false)
            .register(self.context.as_ref(), Box::new(callback))
            .map_err(map_rusb_error)?;

        debug!("Hot-plug callbacks registered for {}", identity);
        Ok(registration)
    }
}

impl EventSession<RusbTransport> {
    /// Event-driven session over libusb
    pub fn usb(config: SessionConfig) -> Result<Self> {
        Ok(Self::new(RusbTransport::new()?, config))
    }
}

/// Forwards libusb hotplug callbacks to a session
struct HotplugCallback {
    identity: TargetIdentity,
    poster: Arc<dyn EventPoster>,
}

impl HotplugCallback {
    fn ids<T: UsbContext>(&self, device: &Device<T>) -> (u16, u16) {
        device
            .device_descriptor()
            .map(|desc| (desc.vendor_id(), desc.product_id()))
            .unwrap_or((self.identity.vendor_id, self.identity.product_id))
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        let (vendor_id, product_id) = self.ids(&device);
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.poster.post(BackendEvent::Hotplug(HotplugEvent::Arrived {
            vendor_id,
            product_id,
        }));
    }

    fn device_left(&mut self, device: Device<T>) {
        let (vendor_id, product_id) = self.ids(&device);
        debug!(
            "Hot-plug: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.poster.post(BackendEvent::Hotplug(HotplugEvent::Left {
            vendor_id,
            product_id,
        }));
    }
}

fn post_cancelled(transfer: PendingTransfer) {
    transfer.poster.post(BackendEvent::Transfer(Completion {
        request: transfer.request,
        status: TransferStatus::Cancelled,
        actual_length: 0,
    }));
}

fn transfer_status(err: TransportError) -> TransferStatus {
    match err {
        TransportError::Timeout => TransferStatus::TimedOut,
        TransportError::Stall => TransferStatus::Stall,
        TransportError::NoDevice => TransferStatus::NoDevice,
        other => {
            warn!("Transfer failed: {}", other);
            TransferStatus::Error(other.to_string())
        }
    }
}

fn is_root_hub<T: UsbContext>(device: &Device<T>) -> bool {
    device
        .device_descriptor()
        .is_ok_and(|desc| desc.vendor_id() == LINUX_FOUNDATION_VID && desc.class_code() == HUB_CLASS)
}
