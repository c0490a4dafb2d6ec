//! Event-driven session (USB-style)
//!
//! Two threads per session. The event pump keeps the backend's event loop
//! turning; the reader keeps read transfers submitted while the device is
//! RUNNING and handles everything the backend posts to the session inbox:
//! transfer completions and hotplug notifications. All user callbacks run on
//! the reader thread, outside the session lock.

use crate::config::SessionConfig;
use crate::error::{Result, SessionError, TransportError};
use crate::handlers::Handlers;
use crate::state::{Backoff, SessionCore, SessionState};
use crate::transport::{AsyncTransport, EventPoster, OpenDevice};
use crate::usb::pump::EventPump;
use common::{
    BackendEvent, Completion, DeviceDescriptor, DeviceFilter, EventStream, HotplugEvent,
    TargetIdentity, TransferId, TransferRequest, TransferStatus,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// A session driven by asynchronous transfers and backend events
pub struct EventSession<B: AsyncTransport> {
    shared: Arc<EventShared<B>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<EventPump>>,
    hotplug: Mutex<Option<B::Registration>>,
}

struct EventShared<B: AsyncTransport> {
    backend: Arc<B>,
    core: Arc<SessionCore<B::Handle>>,
    handlers: Handlers,
    config: SessionConfig,
    next_id: AtomicU64,
    tracked: Mutex<Tracked>,
}

/// Transfers the session has submitted and not yet released
#[derive(Default)]
struct Tracked {
    reads: HashSet<TransferId>,
    writes: HashSet<TransferId>,
}

/// What the reader does after releasing the session lock
enum Step<H> {
    Exit,
    Event(BackendEvent),
    Connected,
    Reopen(TargetIdentity),
    Submit(Arc<H>),
}

/// Reader-thread bookkeeping
struct ReaderState<H> {
    backoff: Backoff,
    /// Earliest time for the next open or submit after a failure
    retry_at: Option<Instant>,
    /// Handle of the current connection, kept for cancellation
    active: Option<Arc<H>>,
}

impl<H> ReaderState<H> {
    fn retry_pending(&self) -> bool {
        self.retry_at.is_some_and(|at| Instant::now() < at)
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + delay);
        trace!("Next attempt in {:?}", delay);
    }

    fn clear_retry(&mut self) {
        self.backoff.reset();
        self.retry_at = None;
    }
}

impl<B: AsyncTransport> EventSession<B> {
    /// Create a session in state NONE over `backend`
    pub fn new(backend: B, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(EventShared {
                backend: Arc::new(backend),
                core: Arc::new(SessionCore::new()),
                handlers: Handlers::new(),
                config,
                next_id: AtomicU64::new(1),
                tracked: Mutex::new(Tracked::default()),
            }),
            reader: Mutex::new(None),
            pump: Mutex::new(None),
            hotplug: Mutex::new(None),
        }
    }

    /// Enumerate devices visible to the backend that match `filter`
    pub fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<DeviceDescriptor>> {
        let devices = self
            .shared
            .backend
            .devices()
            .map_err(SessionError::Enumerate)?;
        Ok(filter.apply(devices))
    }

    /// Open `identity` synchronously, then start the pump and reader threads
    ///
    /// Same contract as the polling session: idempotent once started, and a
    /// failed first open leaves the session in NONE.
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

        let handle = self.shared.backend.open(&identity).map_err(|source| {
            warn!("Failed to open {}: {}", identity, source);
            SessionError::OpenFailed {
                target: identity.to_string(),
                source,
            }
        })?;

        let pump = EventPump::spawn(
            format!("pump-{}", identity),
            Arc::clone(&self.shared.backend),
            self.shared.config.pump_slice(),
        )?;

        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name(format!("usb-{}", identity))
            .spawn(move || shared.run())?;

        *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);
        let committed = self.shared.core.lock().open(identity, Arc::new(handle));
        self.shared.core.notify();
        *reader = Some(thread);

        match committed {
            Ok(()) => {
                info!("Event session started for {}", identity);
                Ok(())
            }
            Err(_) => {
                // stop() ran before the pump was stored
                if let Some(pump) = self
                    .pump
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                {
                    pump.request_stop();
                }
                Err(SessionError::Terminated)
            }
        }
    }

    /// Request termination; never blocks on the session threads
    pub fn stop(&self) {
        if self.shared.core.stop() {
            info!("Event session stopping");
        }
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            pump.request_stop();
        }
    }

    /// Submit `data` to the device's OUT endpoint
    ///
    /// Returns once the backend accepted the transfer; delivery is not
    /// confirmed. Failed deliveries are resubmitted while the device stays
    /// connected.
    pub fn write(&self, data: &[u8]) -> Result<TransferId> {
        if data.is_empty() {
            return Err(SessionError::InvalidParameter("empty write buffer"));
        }
        let handle = self
            .shared
            .core
            .lock()
            .handle()
            .ok_or(SessionError::NotOpen)?;
        let endpoint = handle
            .descriptor()
            .out_endpoint
            .ok_or(SessionError::Unsupported("device has no OUT endpoint"))?;

        let request = self.shared.request(endpoint, data.to_vec());
        let id = request.id;
        self.shared.tracked().writes.insert(id);

        if let Err(e) = self
            .shared
            .backend
            .submit(&handle, request, self.shared.poster())
        {
            self.shared.tracked().writes.remove(&id);
            warn!("Write submission failed: {}", e);
            return Err(SessionError::Transfer(e));
        }

        trace!("Write {} submitted ({} bytes)", id, data.len());
        Ok(id)
    }

    /// Register for attach/detach notifications of the session's device
    ///
    /// Must be called after `start` and before `stop`. Returns `Unsupported`
    /// when the platform has no hotplug capability; the session keeps working
    /// without it.
    pub fn enable_hotplug(&self) -> Result<()> {
        if self.shared.core.state().is_terminal() {
            return Err(SessionError::Terminated);
        }
        let identity = self.shared.core.identity().ok_or(SessionError::NotOpen)?;
        let mut slot = self.hotplug.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        match self
            .shared
            .backend
            .register_hotplug(&identity, self.shared.poster())
        {
            Ok(registration) => {
                *slot = Some(registration);
                info!("Hot-plug monitoring enabled for {}", identity);
                Ok(())
            }
            Err(TransportError::Unsupported) => {
                warn!("Hot-plug is not supported on this platform");
                Err(SessionError::Unsupported("hotplug"))
            }
            Err(e) => Err(SessionError::Hotplug(e)),
        }
    }

    pub fn on_data<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.shared.handlers.set_data(handler);
    }

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

    pub fn pump_running(&self) -> bool {
        self.pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(EventPump::is_running)
    }
}

impl<B: AsyncTransport> Drop for EventSession<B> {
    fn drop(&mut self) {
        self.shared.core.stop();

        // Deregister before joining so no callback races the teardown
        drop(
            self.hotplug
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let reader = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = reader
            && thread.join().is_err()
        {
            error!("Event reader thread panicked");
        }

        // EventPump joins its thread on drop
        drop(
            self.pump
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }
}

impl<B: AsyncTransport> EventShared<B> {
    fn poster(&self) -> Arc<dyn EventPoster> {
        Arc::clone(&self.core) as Arc<dyn EventPoster>
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self, endpoint: u8, buffer: Vec<u8>) -> TransferRequest {
        TransferRequest {
            id: TransferId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            kind: self.config.transfer_kind,
            endpoint,
            buffer,
            timeout: self.config.transfer_timeout(),
        }
    }

    /// Reader thread body
    fn run(&self) {
        debug!("Event reader started");
        let mut reader = ReaderState {
            backoff: Backoff::new(&self.config.backoff),
            retry_at: None,
            active: None,
        };

        loop {
            match self.next_step(&mut reader) {
                Step::Exit => break,
                Step::Event(BackendEvent::Transfer(completion)) => {
                    self.on_completion(completion, &mut reader)
                }
                Step::Event(BackendEvent::Hotplug(event)) => self.on_hotplug(event, &mut reader),
                Step::Connected => self.handlers.notify_connectivity(true),
                Step::Reopen(identity) => self.reopen(identity, &mut reader),
                Step::Submit(handle) => self.submit_read(handle, &mut reader),
            }
        }

        if let Some(handle) = reader.active.take() {
            self.cancel_in_flight(&handle);
        }
        debug!("Event reader stopped");
    }

    /// Wait under the session lock until there is something to do
    fn next_step(&self, reader: &mut ReaderState<B::Handle>) -> Step<B::Handle> {
        let mut guard = self.core.lock();
        loop {
            if guard.state().is_terminal() {
                return Step::Exit;
            }
            if let Some(event) = guard.pop_event() {
                return Step::Event(event);
            }

            match guard.state() {
                SessionState::Opened => {
                    let Some(handle) = guard.handle() else {
                        return Step::Exit;
                    };
                    if let Err(e) = guard.connect(Arc::clone(&handle)) {
                        warn!("Cannot enter RUNNING: {}", e);
                        return Step::Exit;
                    }
                    reader.clear_retry();
                    reader.active = Some(handle);
                    return Step::Connected;
                }
                SessionState::Closed if !reader.retry_pending() => {
                    if let Some(identity) = guard.identity() {
                        return Step::Reopen(identity);
                    }
                    return Step::Exit;
                }
                SessionState::Running
                    if !reader.retry_pending()
                        && self.tracked().reads.len() < self.config.in_flight_reads.max(1) =>
                {
                    if let Some(handle) = guard.handle() {
                        return Step::Submit(handle);
                    }
                    return Step::Exit;
                }
                _ => {}
            }

            guard = match reader.retry_at {
                Some(at) if reader.retry_pending() => {
                    let remaining = at.saturating_duration_since(Instant::now());
                    self.core.wait_timeout(guard, remaining)
                }
                _ => self.core.wait(guard),
            };
        }
    }

    fn reopen(&self, identity: TargetIdentity, reader: &mut ReaderState<B::Handle>) {
        let opened = self.backend.open(&identity).map(Arc::new);

        let mut guard = self.core.lock();
        match opened {
            Ok(handle) if guard.state() == SessionState::Closed => {
                if let Err(e) = guard.connect(Arc::clone(&handle)) {
                    warn!("Cannot enter RUNNING: {}", e);
                    return;
                }
                drop(guard);
                reader.clear_retry();
                reader.active = Some(handle);
                info!("Device {} reconnected", identity);
                self.handlers.notify_connectivity(true);
            }
            Ok(_) => {}
            Err(e) => {
                drop(guard);
                debug!("Reopen {} failed: {}", identity, e);
                reader.schedule_retry();
            }
        }
    }

    fn submit_read(&self, handle: Arc<B::Handle>, reader: &mut ReaderState<B::Handle>) {
        let Some(endpoint) = handle.descriptor().in_endpoint else {
            warn!("Device has no IN endpoint; not reading");
            reader.schedule_retry();
            return;
        };

        let request = self.request(endpoint, vec![0u8; self.config.async_buffer_size.max(1)]);
        let id = request.id;
        self.tracked().reads.insert(id);

        match self.backend.submit(&handle, request, self.poster()) {
            Ok(()) => {
                trace!("Read {} submitted on {:#04x}", id, endpoint);
                reader.retry_at = None;
            }
            Err(e) => {
                self.tracked().reads.remove(&id);
                warn!("Read submission failed: {}", e);
                reader.schedule_retry();
            }
        }
    }

    fn on_completion(&self, completion: Completion, reader: &mut ReaderState<B::Handle>) {
        let id = completion.request.id;
        if self.tracked().reads.remove(&id) {
            self.on_read_complete(completion, reader);
        } else if self.tracked().writes.contains(&id) {
            self.on_write_complete(completion, reader);
        } else {
            trace!("Dropping completion for untracked transfer {}", id);
        }
    }

    fn on_read_complete(&self, completion: Completion, reader: &mut ReaderState<B::Handle>) {
        match completion.status {
            TransferStatus::Completed => {
                reader.clear_retry();
                if completion.actual_length > 0 {
                    self.handlers.dispatch_data(completion.payload());
                }
                self.resubmit(completion.request, reader, false);
            }
            TransferStatus::Cancelled => trace!("Read {} cancelled", completion.request.id),
            TransferStatus::NoDevice => self.device_lost(reader),
            // Released; next_step submits a fresh read once the backoff expires
            status => {
                debug!("Read {} failed: {:?}", completion.request.id, status);
                reader.schedule_retry();
            }
        }
    }

    fn on_write_complete(&self, completion: Completion, reader: &mut ReaderState<B::Handle>) {
        let id = completion.request.id;
        match completion.status {
            TransferStatus::Completed => {
                trace!("Write {} delivered ({} bytes)", id, completion.actual_length);
                self.tracked().writes.remove(&id);
            }
            TransferStatus::Cancelled => {
                self.tracked().writes.remove(&id);
            }
            TransferStatus::NoDevice => {
                self.tracked().writes.remove(&id);
                self.device_lost(reader);
            }
            status => {
                debug!("Write {} failed: {:?}", id, status);
                self.resubmit(completion.request, reader, true);
            }
        }
    }

    /// Re-arm a transfer while RUNNING; otherwise release it
    fn resubmit(&self, request: TransferRequest, reader: &mut ReaderState<B::Handle>, write: bool) {
        let id = request.id;
        let handle = {
            let guard = self.core.lock();
            match guard.state() {
                SessionState::Running => guard.handle(),
                _ => None,
            }
        };

        let Some(handle) = handle else {
            if write {
                self.tracked().writes.remove(&id);
            }
            return;
        };

        if !write {
            self.tracked().reads.insert(id);
        }
        if let Err(e) = self.backend.submit(&handle, request, self.poster()) {
            warn!("Resubmitting {} failed: {}", id, e);
            let mut tracked = self.tracked();
            if write {
                tracked.writes.remove(&id);
            } else {
                tracked.reads.remove(&id);
                drop(tracked);
                reader.schedule_retry();
            }
        }
    }

    fn on_hotplug(&self, event: HotplugEvent, reader: &mut ReaderState<B::Handle>) {
        let state = self.core.state();
        match event {
            HotplugEvent::Arrived { .. } if state == SessionState::Closed => {
                info!("Device arrived; reopening");
                reader.clear_retry();
            }
            HotplugEvent::Left { .. } if state == SessionState::Running => {
                info!("Device left");
                self.device_lost(reader);
            }
            other => trace!("Ignoring {:?} in state {}", other, state),
        }
    }

    /// RUNNING -> CLOSED: notify, cancel outstanding transfers, release the handle
    fn device_lost(&self, reader: &mut ReaderState<B::Handle>) {
        let released = {
            let mut guard = self.core.lock();
            if guard.state() != SessionState::Running {
                return;
            }
            match guard.disconnect() {
                Ok(released) => released,
                Err(e) => {
                    debug!("Not marking session closed: {}", e);
                    return;
                }
            }
        };

        warn!("Device lost");
        self.handlers.notify_connectivity(false);

        if let Some(handle) = reader.active.take().or(released.clone()) {
            self.cancel_in_flight(&handle);
        }
        drop(released);
    }

    fn cancel_in_flight(&self, handle: &Arc<B::Handle>) {
        let ids: Vec<TransferId> = {
            let tracked = self.tracked();
            tracked.reads.iter().chain(tracked.writes.iter()).copied().collect()
        };
        if !ids.is_empty() {
            debug!("Cancelling {} in-flight transfers", ids.len());
        }
        for id in ids {
            self.backend.cancel(handle, id);
        }
    }
}
