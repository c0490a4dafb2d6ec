//! Test utilities for device sessions
//!
//! Scriptable in-memory transports for exercising sessions without hardware.
//!
//! # Example
//!
//! ```
//! use common::TargetIdentity;
//! use session::test_utils::{MockRead, MockTransport, create_mock_descriptor};
//! use session::transport::{PollingIo, Transport};
//! use std::time::Duration;
//!
//! let transport = MockTransport::with_devices(vec![create_mock_descriptor(0x1234, 0x5678)]);
//! transport.push_read(MockRead::Data(vec![1, 2, 3]));
//!
//! let handle = transport.open(&TargetIdentity::new(0x1234, 0x5678)).unwrap();
//! let mut buf = [0u8; 8];
//! assert_eq!(handle.read(&mut buf, Duration::from_millis(10)).unwrap(), 3);
//! ```

use crate::error::TransportError;
use crate::transport::{
    AsyncTransport, ControlRequest, EventPoster, OpenDevice, PollingIo, Transport, UsbIo,
};
use common::{
    BackendEvent, Completion, DeviceDescriptor, HotplugEvent, TargetIdentity, TransferId,
    TransferKind, TransferRequest, TransferStatus,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an idle mock read or pump slice sleeps
const IDLE_TICK: Duration = Duration::from_millis(5);

/// Descriptor of a mock device with bulk endpoints 0x81/0x01
pub fn create_mock_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    let mut descriptor =
        DeviceDescriptor::new(vendor_id, product_id).with_endpoints(Some(0x81), Some(0x01));
    descriptor.interface = Some(0);
    descriptor.product = Some(format!("Test Product {:04x}", product_id));
    descriptor.serial_number = Some(format!("SN{:04x}{:04x}", vendor_id, product_id));
    descriptor
}

/// Poll `predicate` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// One scripted result of [`PollingIo::read`]
#[derive(Debug, Clone)]
pub enum MockRead {
    Data(Vec<u8>),
    /// Poll timeout with nothing received
    Empty,
    Error(TransportError),
}

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceDescriptor>,
    open_script: VecDeque<bool>,
    open_fails_by_default: bool,
    reads: VecDeque<MockRead>,
    transfers: VecDeque<Result<usize, TransportError>>,
    writes: Vec<Vec<u8>>,
    feature_report: Vec<u8>,
    open_attempts: usize,
    opens: usize,
    closes: usize,
    transfer_attempts: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`Transport`] whose handles implement [`PollingIo`] and [`UsbIo`]
///
/// Clones share state, so a test keeps one clone for scripting and
/// assertions while the session owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        let transport = Self::new();
        lock(&transport.state).devices = devices;
        transport
    }

    /// Make the next `count` open attempts fail
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.state)
            .open_script
            .extend(std::iter::repeat_n(false, count));
    }

    /// Make every unscripted open attempt fail (or succeed again)
    pub fn set_open_fails(&self, fail: bool) {
        lock(&self.state).open_fails_by_default = fail;
    }

    pub fn push_read(&self, read: MockRead) {
        lock(&self.state).reads.push_back(read);
    }

    pub fn push_reads(&self, reads: impl IntoIterator<Item = MockRead>) {
        lock(&self.state).reads.extend(reads);
    }

    /// Script the result of the next synchronous USB transfer
    pub fn push_transfer_result(&self, result: Result<usize, TransportError>) {
        lock(&self.state).transfers.push_back(result);
    }

    pub fn set_feature_report(&self, report: Vec<u8>) {
        lock(&self.state).feature_report = report;
    }

    pub fn feature_report(&self) -> Vec<u8> {
        lock(&self.state).feature_report.clone()
    }

    pub fn pending_reads(&self) -> usize {
        lock(&self.state).reads.len()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    pub fn open_attempts(&self) -> usize {
        lock(&self.state).open_attempts
    }

    /// Successful opens
    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    /// Handles dropped
    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn open_handles(&self) -> usize {
        let state = lock(&self.state);
        state.opens - state.closes
    }

    pub fn transfer_attempts(&self) -> usize {
        lock(&self.state).transfer_attempts
    }

    fn next_transfer(&self, requested: usize) -> Result<usize, TransportError> {
        let mut state = lock(&self.state);
        state.transfer_attempts += 1;
        state.transfers.pop_front().unwrap_or(Ok(requested))
    }
}

impl Transport for MockTransport {
    type Handle = MockHandle;

    fn devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(lock(&self.state).devices.clone())
    }

    fn open(&self, identity: &TargetIdentity) -> Result<MockHandle, TransportError> {
        let mut state = lock(&self.state);
        state.open_attempts += 1;

        let default = !state.open_fails_by_default;
        if !state.open_script.pop_front().unwrap_or(default) {
            return Err(TransportError::NotFound);
        }

        let descriptor = state
            .devices
            .iter()
            .find(|d| d.matches_identity(identity))
            .cloned()
            .unwrap_or_else(|| create_mock_descriptor(identity.vendor_id, identity.product_id));
        state.opens += 1;

        Ok(MockHandle {
            transport: self.clone(),
            descriptor,
        })
    }
}

/// Handle returned by [`MockTransport::open`]; counts as closed when dropped
pub struct MockHandle {
    transport: MockTransport,
    descriptor: DeviceDescriptor,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        lock(&self.transport.state).closes += 1;
    }
}

impl OpenDevice for MockHandle {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

impl PollingIo for MockHandle {
    /// Pops the next scripted read; an empty script behaves like an idle poll
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let next = lock(&self.transport.state).reads.pop_front();
        match next {
            Some(MockRead::Data(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(MockRead::Empty) => Ok(0),
            Some(MockRead::Error(e)) => Err(e),
            None => {
                std::thread::sleep(timeout.min(IDLE_TICK));
                Ok(0)
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        lock(&self.transport.state).writes.push(data.to_vec());
        Ok(data.len())
    }

    fn send_feature_report(&self, data: &[u8]) -> Result<(), TransportError> {
        self.transport.set_feature_report(data.to_vec());
        Ok(())
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let report = self.transport.feature_report();
        if report.first() != buf.first() {
            return Err(TransportError::Other("unknown report ID".to_string()));
        }
        let len = report.len().min(buf.len());
        buf[..len].copy_from_slice(&report[..len]);
        Ok(len)
    }
}

impl UsbIo for MockHandle {
    fn read(
        &self,
        _kind: TransferKind,
        _endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.transport.next_transfer(buf.len())
    }

    fn write(
        &self,
        _kind: TransferKind,
        _endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let result = self.transport.next_transfer(data.len());
        if result.is_ok() {
            lock(&self.transport.state).writes.push(data.to_vec());
        }
        result
    }

    fn read_control(
        &self,
        _request: ControlRequest,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.transport.next_transfer(buf.len())
    }

    fn write_control(
        &self,
        _request: ControlRequest,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.transport.next_transfer(data.len())
    }
}

struct PendingTransfer {
    _handle: Arc<MockHandle>,
    request: TransferRequest,
    poster: Arc<dyn EventPoster>,
}

#[derive(Default)]
struct BackendState {
    pending: BTreeMap<TransferId, PendingTransfer>,
    submit_failures: usize,
    submits: usize,
    accepted: Vec<TransferId>,
    cancels: Vec<TransferId>,
    pumps: usize,
    hotplug_supported: bool,
    hotplug: Option<Arc<dyn EventPoster>>,
}

/// In-memory [`AsyncTransport`]
///
/// Submitted transfers stay pending until the test completes them with
/// [`complete_read`](Self::complete_read) and friends. Opening and
/// enumeration are delegated to a [`MockTransport`].
#[derive(Clone)]
pub struct MockUsbBackend {
    transport: MockTransport,
    state: Arc<Mutex<BackendState>>,
}

impl MockUsbBackend {
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(BackendState {
                hotplug_supported: true,
                ..BackendState::default()
            })),
        }
    }

    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }

    /// Make the next `count` submissions fail
    pub fn fail_next_submits(&self, count: usize) {
        lock(&self.state).submit_failures += count;
    }

    pub fn set_hotplug_supported(&self, supported: bool) {
        lock(&self.state).hotplug_supported = supported;
    }

    pub fn hotplug_registered(&self) -> bool {
        lock(&self.state).hotplug.is_some()
    }

    pub fn pending_reads(&self) -> usize {
        lock(&self.state)
            .pending
            .values()
            .filter(|t| t.request.is_in())
            .count()
    }

    pub fn pending_writes(&self) -> usize {
        lock(&self.state)
            .pending
            .values()
            .filter(|t| !t.request.is_in())
            .count()
    }

    /// Accepted and rejected submissions, resubmissions included
    pub fn submits(&self) -> usize {
        lock(&self.state).submits
    }

    /// IDs of accepted submissions, in order
    pub fn accepted(&self) -> Vec<TransferId> {
        lock(&self.state).accepted.clone()
    }

    pub fn cancels(&self) -> Vec<TransferId> {
        lock(&self.state).cancels.clone()
    }

    pub fn pumps(&self) -> usize {
        lock(&self.state).pumps
    }

    /// Complete the oldest pending read with `data`
    pub fn complete_read(&self, data: &[u8]) -> bool {
        self.finish(true, |request| {
            let len = data.len().min(request.buffer.len());
            request.buffer[..len].copy_from_slice(&data[..len]);
            (TransferStatus::Completed, len)
        })
    }

    /// Finish the oldest pending read with `status` and no data
    pub fn fail_read(&self, status: TransferStatus) -> bool {
        self.finish(true, |_| (status, 0))
    }

    /// Finish the oldest pending write with `status`
    pub fn complete_write(&self, status: TransferStatus) -> bool {
        self.finish(false, |request| {
            let len = if status.is_success() {
                request.buffer.len()
            } else {
                0
            };
            (status, len)
        })
    }

    /// Deliver a hotplug event as the platform would
    pub fn emit_hotplug(&self, event: HotplugEvent) -> bool {
        let poster = lock(&self.state).hotplug.clone();
        match poster {
            Some(poster) => {
                poster.post(BackendEvent::Hotplug(event));
                true
            }
            None => false,
        }
    }

    fn finish(
        &self,
        read: bool,
        fill: impl FnOnce(&mut TransferRequest) -> (TransferStatus, usize),
    ) -> bool {
        let transfer = {
            let mut state = lock(&self.state);
            let id = state
                .pending
                .iter()
                .find(|(_, t)| t.request.is_in() == read)
                .map(|(id, _)| *id);
            match id.and_then(|id| state.pending.remove(&id)) {
                Some(transfer) => transfer,
                None => return false,
            }
        };

        let PendingTransfer {
            _handle,
            mut request,
            poster,
        } = transfer;
        let (status, actual_length) = fill(&mut request);
        drop(_handle);
        poster.post(BackendEvent::Transfer(Completion {
            request,
            status,
            actual_length,
        }));
        true
    }
}

impl Transport for MockUsbBackend {
    type Handle = MockHandle;

    fn devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        self.transport.devices()
    }

    fn open(&self, identity: &TargetIdentity) -> Result<MockHandle, TransportError> {
        self.transport.open(identity)
    }
}

/// Keeps the mock hotplug callback registered until dropped
pub struct MockRegistration {
    state: Arc<Mutex<BackendState>>,
}

impl Drop for MockRegistration {
    fn drop(&mut self) {
        lock(&self.state).hotplug = None;
    }
}

impl AsyncTransport for MockUsbBackend {
    type Registration = MockRegistration;

    fn submit(
        &self,
        handle: &Arc<MockHandle>,
        request: TransferRequest,
        poster: Arc<dyn EventPoster>,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.submits += 1;
        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            return Err(TransportError::Io("scripted submit failure".to_string()));
        }
        state.accepted.push(request.id);
        state.pending.insert(
            request.id,
            PendingTransfer {
                _handle: Arc::clone(handle),
                request,
                poster,
            },
        );
        Ok(())
    }

    fn cancel(&self, _handle: &Arc<MockHandle>, id: TransferId) {
        let transfer = {
            let mut state = lock(&self.state);
            state.cancels.push(id);
            state.pending.remove(&id)
        };
        if let Some(transfer) = transfer {
            transfer.poster.post(BackendEvent::Transfer(Completion {
                request: transfer.request,
                status: TransferStatus::Cancelled,
                actual_length: 0,
            }));
        }
    }

    fn pump_events(&self, slice: Duration) -> Result<(), TransportError> {
        lock(&self.state).pumps += 1;
        std::thread::sleep(slice.min(IDLE_TICK));
        Ok(())
    }

    fn register_hotplug(
        &self,
        _identity: &TargetIdentity,
        poster: Arc<dyn EventPoster>,
    ) -> Result<MockRegistration, TransportError> {
        let mut state = lock(&self.state);
        if !state.hotplug_supported {
            return Err(TransportError::Unsupported);
        }
        state.hotplug = Some(poster);
        Ok(MockRegistration {
            state: Arc::clone(&self.state),
        })
    }
}
