//! Polling session (HID-style)
//!
//! One background thread alternates between "ensure the device is open" and
//! "blocking read", pushing every received chunk through the data handler.
//! Device loss is not an error surfaced to the caller: the thread reports it
//! through the connectivity handler and goes back to reopening the device
//! with a capped exponential backoff, until the session is stopped.

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::handlers::Handlers;
use crate::state::{Backoff, SessionCore, SessionState};
use crate::transport::{OpenDevice, PollingIo, Transport};
use common::{DeviceDescriptor, DeviceFilter, EventStream, TargetIdentity};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// A session that continuously polls one device for inbound reports
pub struct PollingSession<T>
where
    T: Transport,
    T::Handle: PollingIo,
{
    shared: Arc<PollingShared<T>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the public session object and its reader thread
struct PollingShared<T: Transport> {
    transport: T,
    core: SessionCore<T::Handle>,
    handlers: Handlers,
    config: SessionConfig,
}

#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    /// The read failed; the device is gone
    Lost,
    /// TERMINATE was observed between reads
    Stopped,
}

impl<T> PollingSession<T>
where
    T: Transport,
    T::Handle: PollingIo,
{
    /// Create a session in state NONE; nothing is opened until [`start`](Self::start)
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(PollingShared {
                transport,
                core: SessionCore::new(),
                handlers: Handlers::new(),
                config,
            }),
            reader: Mutex::new(None),
        }
    }

    /// Enumerate devices visible to the transport that match `filter`
    pub fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<DeviceDescriptor>> {
        let devices = self
            .shared
            .transport
            .devices()
            .map_err(SessionError::Enumerate)?;
        Ok(filter.apply(devices))
    }

    /// Open `identity` synchronously and start the reader thread
    ///
    /// Idempotent: once started, further calls return `Ok(())` without
    /// opening anything. If the first open fails the session stays in NONE
    /// and `start` may be retried. A stopped session cannot be restarted.
    pub fn start(&self, identity: TargetIdentity) -> Result<()> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);

        match self.shared.core.state() {
            SessionState::None => {}
            SessionState::Terminate => return Err(SessionError::Terminated),
            state => {
                debug!("start({}) ignored, session already {}", identity, state);
                return Ok(());
            }
        }

        let handle = self.shared.transport.open(&identity).map_err(|source| {
            warn!("Failed to open {}: {}", identity, source);
            SessionError::OpenFailed {
                target: identity.to_string(),
                source,
            }
        })?;
        debug!("Opened {} ({:?})", identity, handle.descriptor().product);

        // The thread parks until the state leaves NONE, so it can be spawned
        // before the open handle is committed.
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name(format!("poll-{}", identity))
            .spawn(move || shared.run())?;

        let committed = self.shared.core.lock().open(identity, Arc::new(handle));
        self.shared.core.notify();
        *reader = Some(thread);

        match committed {
            Ok(()) => {
                info!("Polling session started for {}", identity);
                Ok(())
            }
            // stop() won the race; the reader exits on its own
            Err(_) => Err(SessionError::Terminated),
        }
    }

    /// Request termination and wake the reader thread
    ///
    /// Never blocks on the reader and is safe to call repeatedly, including
    /// before `start`. The thread is joined when the session is dropped.
    pub fn stop(&self) {
        if self.shared.core.stop() {
            info!("Polling session stopping");
        }
    }

    /// Write `data` to the device
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(SessionError::InvalidParameter("empty write buffer"));
        }
        let handle = self.current_handle()?;
        handle.write(data).map_err(SessionError::Transfer)
    }

    /// Read one report directly, bypassing the data handler
    ///
    /// Competes with the reader thread for inbound reports; meant for
    /// sessions whose data handler is not used.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(SessionError::InvalidParameter("empty read buffer"));
        }
        let handle = self.current_handle()?;
        handle
            .read(buf, self.shared.config.transfer_timeout())
            .map_err(SessionError::Transfer)
    }

    /// Send a feature report; `data[0]` is the report ID
    pub fn send_feature_report(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(SessionError::InvalidParameter("empty feature report"));
        }
        let handle = self.current_handle()?;
        handle
            .send_feature_report(data)
            .map_err(SessionError::Transfer)
    }

    /// Receive feature report `report_id`, reading at most `len` bytes
    pub fn receive_feature_report(&self, report_id: u8, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Err(SessionError::InvalidParameter("zero-length feature report"));
        }
        let handle = self.current_handle()?;
        let mut buf = vec![0u8; len];
        buf[0] = report_id;
        let read = handle
            .get_feature_report(&mut buf)
            .map_err(SessionError::Transfer)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Register the handler invoked with each inbound chunk
    pub fn on_data<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.shared.handlers.set_data(handler);
    }

    /// Register the handler invoked when the connection comes up or drops
    pub fn on_connectivity<F>(&self, handler: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.shared.handlers.set_connectivity(handler);
    }

    /// Replace both handlers with a stream of [`common::SessionEvent`]s
    pub fn subscribe(&self) -> EventStream {
        self.shared
            .handlers
            .subscribe(self.shared.config.event_capacity)
    }

    pub fn state(&self) -> SessionState {
        self.shared.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn identity(&self) -> Option<TargetIdentity> {
        self.shared.core.identity()
    }

    /// Number of live reader threads (0 or 1)
    pub fn reader_threads(&self) -> usize {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |thread| usize::from(!thread.is_finished()))
    }

    fn current_handle(&self) -> Result<Arc<T::Handle>> {
        self.shared.core.lock().handle().ok_or(SessionError::NotOpen)
    }
}

impl<T> Drop for PollingSession<T>
where
    T: Transport,
    T::Handle: PollingIo,
{
    fn drop(&mut self) {
        self.shared.core.stop();
        let thread = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread
            && thread.join().is_err()
        {
            error!("Polling reader thread panicked");
        }
    }
}

impl<T> PollingShared<T>
where
    T: Transport,
    T::Handle: PollingIo,
{
    /// Reader thread body
    fn run(&self) {
        debug!("Polling reader started");
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];
        let mut backoff = Backoff::new(&self.config.backoff);
        let poll = self.config.read_poll_interval();

        while let Some(handle) = self.acquire(&mut backoff) {
            self.handlers.notify_connectivity(true);

            if self.drain(&handle, &mut buf, poll) == ReadOutcome::Stopped {
                break;
            }

            self.handlers.notify_connectivity(false);
            drop(handle);
            match self.core.lock().disconnect() {
                Ok(released) => drop(released),
                Err(e) => debug!("Not marking session closed: {}", e),
            }
        }

        debug!("Polling reader stopped");
    }

    /// Wait until the device is open and RUNNING, or the session terminates
    ///
    /// Returns `None` on TERMINATE. Open failures are retried after the
    /// backoff delay; `stop()` interrupts the wait.
    fn acquire(&self, backoff: &mut Backoff) -> Option<Arc<T::Handle>> {
        let mut guard = self.core.lock();
        loop {
            match guard.state() {
                SessionState::Terminate => return None,
                SessionState::None => guard = self.core.wait(guard),
                SessionState::Running => return guard.handle(),
                SessionState::Opened => {
                    let handle = guard.handle()?;
                    if let Err(e) = guard.connect(Arc::clone(&handle)) {
                        warn!("Cannot enter RUNNING: {}", e);
                        return None;
                    }
                    backoff.reset();
                    return Some(handle);
                }
                SessionState::Closed => {
                    let identity = guard.identity()?;

                    // Open without the lock so stop() is never held up by it
                    drop(guard);
                    let opened = self.transport.open(&identity).map(Arc::new);
                    guard = self.core.lock();

                    match opened {
                        Ok(handle) if guard.state() == SessionState::Closed => {
                            if let Err(e) = guard.connect(Arc::clone(&handle)) {
                                warn!("Cannot enter RUNNING: {}", e);
                                return None;
                            }
                            backoff.reset();
                            info!("Device {} reconnected", identity);
                            return Some(handle);
                        }
                        // Terminated meanwhile; the fresh handle closes on drop
                        Ok(_) => {}
                        Err(e) => {
                            let delay = backoff.next_delay();
                            debug!("Open {} failed: {}; retrying in {:?}", identity, e, delay);
                            guard = self.core.wait_timeout(guard, delay);
                        }
                    }
                }
            }
        }
    }

    /// Read until the device fails or the session terminates
    fn drain(&self, handle: &T::Handle, buf: &mut [u8], poll: Duration) -> ReadOutcome {
        loop {
            if self.core.state().is_terminal() {
                return ReadOutcome::Stopped;
            }

            match handle.read(buf, poll) {
                Ok(0) => trace!("Empty poll"),
                Ok(len) => self.handlers.dispatch_data(&buf[..len]),
                Err(e) => {
                    warn!("Device lost: {}", e);
                    return ReadOutcome::Lost;
                }
            }
        }
    }
}
