//! hidapi transport
//!
//! Wraps the process-wide `HidApi` in a [`SharedContext`] so every HID
//! session shares one library instance, and adapts `HidDevice` to
//! [`PollingIo`].

use crate::config::SessionConfig;
use crate::context::SharedContext;
use crate::error::{Result, SessionError, TransportError};
use crate::polling::PollingSession;
use crate::transport::{OpenDevice, PollingIo, Transport};
use common::{DeviceDescriptor, TargetIdentity};
use hidapi::{DeviceInfo, HidApi, HidDevice, HidError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

static HID_CONTEXT: SharedContext<Mutex<HidApi>> = SharedContext::new("hidapi");

/// Enumerates and opens HID devices through hidapi
pub struct HidTransport {
    api: Arc<Mutex<HidApi>>,
    report_size: usize,
}

impl HidTransport {
    /// Join (or create) the process-wide hidapi context
    pub fn new(report_size: usize) -> Result<Self> {
        let api = HID_CONTEXT
            .acquire(|| HidApi::new().map(Mutex::new))
            .map_err(|e| SessionError::ContextUnavailable(e.to_string()))?;
        Ok(Self {
            api,
            report_size: report_size.max(2),
        })
    }
}

impl Transport for HidTransport {
    type Handle = HidHandle;

    fn devices(&self) -> std::result::Result<Vec<DeviceDescriptor>, TransportError> {
        let mut api = self.api.lock().unwrap_or_else(PoisonError::into_inner);
        api.refresh_devices().map_err(map_hid_error)?;
        Ok(api.device_list().map(describe).collect())
    }

    fn open(&self, identity: &TargetIdentity) -> std::result::Result<HidHandle, TransportError> {
        let mut api = self.api.lock().unwrap_or_else(PoisonError::into_inner);

        // hidapi matches vid/pid on its own; a usage pair needs the path of
        // the matching top-level collection
        let (device, descriptor) = match identity.usage {
            None => {
                let device = api
                    .open(identity.vendor_id, identity.product_id)
                    .map_err(map_hid_error)?;
                let descriptor = device
                    .get_device_info()
                    .map(|info| describe(&info))
                    .unwrap_or_else(|_| {
                        DeviceDescriptor::new(identity.vendor_id, identity.product_id)
                    });
                (device, descriptor)
            }
            Some(_) => {
                api.refresh_devices().map_err(map_hid_error)?;
                let info = api
                    .device_list()
                    .find(|info| describe(info).matches_identity(identity))
                    .ok_or(TransportError::NotFound)?;
                let descriptor = describe(info);
                let path = info.path().to_owned();
                (api.open_path(&path).map_err(map_hid_error)?, descriptor)
            }
        };

        debug!("Opened HID device {}", identity);
        Ok(HidHandle {
            device: Mutex::new(device),
            descriptor,
            report_size: self.report_size,
        })
    }
}

/// An open HID device
pub struct HidHandle {
    device: Mutex<HidDevice>,
    descriptor: DeviceDescriptor,
    report_size: usize,
}

impl HidHandle {
    fn device(&self) -> std::sync::MutexGuard<'_, HidDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OpenDevice for HidHandle {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

impl PollingIo for HidHandle {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> std::result::Result<usize, TransportError> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        self.device()
            .read_timeout(buf, millis)
            .map_err(map_hid_error)
    }

    /// Writes the payload as a sequence of fixed-size output reports
    ///
    /// Returns the number of payload bytes written.
    fn write(&self, data: &[u8]) -> std::result::Result<usize, TransportError> {
        let chunks = report_chunks(data, self.report_size, cfg!(windows));
        let device = self.device();
        let mut written = 0;
        for (payload, report) in chunks {
            device.write(&report).map_err(map_hid_error)?;
            written += payload;
            trace!("Wrote {}-byte HID report", report.len());
        }
        Ok(written)
    }

    fn send_feature_report(&self, data: &[u8]) -> std::result::Result<(), TransportError> {
        self.device()
            .send_feature_report(data)
            .map_err(map_hid_error)
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> std::result::Result<usize, TransportError> {
        self.device()
            .get_feature_report(buf)
            .map_err(map_hid_error)
    }
}

impl PollingSession<HidTransport> {
    /// Polling session over hidapi
    pub fn hid(config: SessionConfig) -> Result<Self> {
        let transport = HidTransport::new(config.max_report_size)?;
        Ok(Self::new(transport, config))
    }
}

/// Split `data` into zero-padded output reports of `report_size` bytes
///
/// With `prefix_report_id` each report starts with report ID 0 and carries
/// `report_size - 1` payload bytes. Yields `(payload_len, report)` pairs.
pub fn report_chunks(
    data: &[u8],
    report_size: usize,
    prefix_report_id: bool,
) -> Vec<(usize, Vec<u8>)> {
    let offset = usize::from(prefix_report_id);
    let capacity = report_size.saturating_sub(offset).max(1);

    data.chunks(capacity)
        .map(|chunk| {
            let mut report = vec![0u8; (chunk.len() + offset).max(report_size)];
            report[offset..offset + chunk.len()].copy_from_slice(chunk);
            (chunk.len(), report)
        })
        .collect()
}

fn describe(info: &DeviceInfo) -> DeviceDescriptor {
    let mut descriptor = DeviceDescriptor::new(info.vendor_id(), info.product_id())
        .with_usage(info.usage_page(), info.usage());
    descriptor.interface = u8::try_from(info.interface_number()).ok();
    descriptor.path = Some(info.path().to_string_lossy().into_owned());
    descriptor.manufacturer = info.manufacturer_string().map(str::to_owned);
    descriptor.product = info.product_string().map(str::to_owned);
    descriptor.serial_number = info.serial_number().map(str::to_owned);
    descriptor
}

fn map_hid_error(err: HidError) -> TransportError {
    match err {
        HidError::HidApiErrorEmpty => TransportError::NotFound,
        HidError::IoError { error } => TransportError::Io(error.to_string()),
        other => TransportError::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_are_padded_to_report_size() {
        let data: Vec<u8> = (1..=10).collect();
        let chunks = report_chunks(&data, 4, false);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (4, vec![1, 2, 3, 4]));
        assert_eq!(chunks[1], (4, vec![5, 6, 7, 8]));
        assert_eq!(chunks[2], (2, vec![9, 10, 0, 0]));
    }

    #[test]
    fn test_chunks_with_report_id_prefix() {
        let data: Vec<u8> = (1..=5).collect();
        let chunks = report_chunks(&data, 4, true);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (3, vec![0, 1, 2, 3]));
        assert_eq!(chunks[1], (2, vec![0, 4, 5, 0]));
        let total: usize = chunks.iter().map(|(n, _)| n).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn test_empty_payload_has_no_reports() {
        assert!(report_chunks(&[], 64, false).is_empty());
    }
}
