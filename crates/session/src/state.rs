//! Session state machine
//!
//! One mutex and one condition variable per session guard the state, the
//! open handle, the target identity and the inbox of backend events. Every
//! state change and every posted event signals the condition variable.
//!
//! ```text
//!   NONE ──start──► OPENED ──open ok──► RUNNING ──read error──► CLOSED
//!                                          ▲                      │
//!                                          └──────reopen ok───────┘
//!   any non-terminal ──stop──► TERMINATE (terminal)
//! ```

use crate::config::BackoffConfig;
use crate::error::{Result, SessionError};
use crate::transport::EventPoster;
use common::{BackendEvent, TargetIdentity};
use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    None,
    Opened,
    Running,
    Closed,
    Terminate,
}

impl SessionState {
    /// Whether the state table allows `self -> to`
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (Terminate, _) => false,
            (_, Terminate) => true,
            (None, Opened) => true,
            (Opened | Closed, Running) => true,
            (Running, Closed) => true,
            _ => false,
        }
    }

    /// States in which the session owns an open handle
    pub fn holds_handle(self) -> bool {
        matches!(self, SessionState::Opened | SessionState::Running)
    }

    /// States in which the reader must (re)acquire the device
    pub fn needs_open(self) -> bool {
        matches!(self, SessionState::Opened | SessionState::Closed)
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Terminate
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::None => "NONE",
            SessionState::Opened => "OPENED",
            SessionState::Running => "RUNNING",
            SessionState::Closed => "CLOSED",
            SessionState::Terminate => "TERMINATE",
        };
        f.write_str(name)
    }
}

/// Data guarded by the session lock
pub struct CoreInner<H> {
    state: SessionState,
    handle: Option<Arc<H>>,
    identity: Option<TargetIdentity>,
    inbox: VecDeque<BackendEvent>,
}

impl<H> CoreInner<H> {
    fn new() -> Self {
        Self {
            state: SessionState::None,
            handle: None,
            identity: None,
            inbox: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Clone of the open handle, for one I/O call outside the lock
    pub fn handle(&self) -> Option<Arc<H>> {
        self.handle.clone()
    }

    pub fn identity(&self) -> Option<TargetIdentity> {
        self.identity
    }

    /// Apply one transition, keeping `handle` present iff OPENED/RUNNING
    ///
    /// A handle released by the transition is returned so the caller decides
    /// where the close happens.
    fn transition(&mut self, to: SessionState) -> Result<Option<Arc<H>>> {
        let from = self.state;
        if !from.can_transition_to(to) || (to.holds_handle() && self.handle.is_none()) {
            return Err(SessionError::InvalidTransition { from, to });
        }
        let released = if to.holds_handle() {
            None
        } else {
            self.handle.take()
        };
        self.state = to;
        debug!("Session state {} -> {}", from, to);
        Ok(released)
    }

    /// NONE -> OPENED with the handle from the synchronous first open
    pub fn open(&mut self, identity: TargetIdentity, handle: Arc<H>) -> Result<()> {
        if self.state != SessionState::None {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: SessionState::Opened,
            });
        }
        self.identity = Some(identity);
        self.handle = Some(handle);
        self.transition(SessionState::Opened).map(|_| ())
    }

    /// OPENED/CLOSED -> RUNNING
    ///
    /// `handle` replaces any handle already held (OPENED keeps the one from
    /// `start`, so callers pass that same handle back).
    pub fn connect(&mut self, handle: Arc<H>) -> Result<()> {
        if !self.state.needs_open() {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: SessionState::Running,
            });
        }
        self.handle = Some(handle);
        self.transition(SessionState::Running).map(|_| ())
    }

    /// RUNNING -> CLOSED, returning the released handle
    pub fn disconnect(&mut self) -> Result<Option<Arc<H>>> {
        self.transition(SessionState::Closed)
    }

    /// Any non-terminal state -> TERMINATE
    ///
    /// Returns `None` and changes nothing when already terminated.
    pub fn terminate(&mut self) -> Option<Option<Arc<H>>> {
        if self.state.is_terminal() {
            return None;
        }
        self.transition(SessionState::Terminate).ok()
    }

    pub fn pop_event(&mut self) -> Option<BackendEvent> {
        self.inbox.pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.inbox.is_empty()
    }

    fn drain_events(&mut self) -> usize {
        let dropped = self.inbox.len();
        self.inbox.clear();
        dropped
    }
}

/// Lock, condition variable and guarded state of one session
pub struct SessionCore<H> {
    inner: Mutex<CoreInner<H>>,
    cond: Condvar,
}

impl<H> Default for SessionCore<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SessionCore<H> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CoreInner::new()),
            cond: Condvar::new(),
        }
    }

    /// Acquire the session lock
    ///
    /// A poisoned lock only means a user callback panicked elsewhere; the
    /// guarded data is still consistent because callbacks never run under it.
    pub fn lock(&self) -> MutexGuard<'_, CoreInner<H>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, CoreInner<H>>) -> MutexGuard<'a, CoreInner<H>> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, CoreInner<H>>,
        timeout: Duration,
    ) -> MutexGuard<'a, CoreInner<H>> {
        match self.cond.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub fn notify(&self) {
        self.cond.notify_all();
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn identity(&self) -> Option<TargetIdentity> {
        self.lock().identity
    }

    /// Move to TERMINATE and wake every waiter
    ///
    /// Safe to call any number of times. The handle held by the session is
    /// released here; a reader that is mid-read keeps its own reference until
    /// that read returns, so the device is closed exactly once either way.
    pub fn stop(&self) -> bool {
        let mut guard = self.lock();
        let Some(released) = guard.terminate() else {
            return false;
        };
        let dropped = guard.drain_events();
        if dropped > 0 {
            debug!("Discarded {} pending backend events on stop", dropped);
        }
        drop(guard);
        self.notify();
        drop(released);
        true
    }
}

impl<H: Send + Sync> EventPoster for SessionCore<H> {
    fn post(&self, event: BackendEvent) {
        let mut guard = self.lock();
        if guard.state.is_terminal() {
            return;
        }
        guard.inbox.push_back(event);
        drop(guard);
        self.notify();
    }
}

/// Capped exponential delay between failed open or submit attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms.max(1));
        Self {
            initial,
            max: Duration::from_millis(config.max_ms).max(initial),
            current: None,
        }
    }

    /// Delay before the next attempt; doubles each call up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let base = match self.current {
            None => self.initial,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(base);

        let jitter_ms = (base.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 5] = [None, Opened, Running, Closed, Terminate];

    #[test]
    fn test_transition_table() {
        assert!(None.can_transition_to(Opened));
        assert!(Opened.can_transition_to(Running));
        assert!(Closed.can_transition_to(Running));
        assert!(Running.can_transition_to(Closed));
        for state in [None, Opened, Running, Closed] {
            assert!(state.can_transition_to(Terminate));
        }

        assert!(!None.can_transition_to(Running));
        assert!(!Opened.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Opened));
        assert!(!Running.can_transition_to(Opened));
    }

    #[test]
    fn test_terminate_is_absorbing() {
        for to in ALL {
            assert!(!Terminate.can_transition_to(to));
        }
    }

    #[test]
    fn test_handle_present_iff_opened_or_running() {
        let mut inner: CoreInner<u8> = CoreInner::new();
        let id = TargetIdentity::new(1, 2);

        inner.open(id, Arc::new(7)).unwrap();
        assert_eq!(inner.state(), Opened);
        assert!(inner.handle().is_some());

        let handle = inner.handle().unwrap();
        inner.connect(handle).unwrap();
        assert_eq!(inner.state(), Running);

        let released = inner.disconnect().unwrap();
        assert!(released.is_some());
        assert_eq!(inner.state(), Closed);
        assert!(inner.handle().is_none());

        inner.connect(Arc::new(8)).unwrap();
        assert_eq!(inner.handle().as_deref(), Some(&8));

        assert!(inner.terminate().unwrap().is_some());
        assert!(inner.handle().is_none());
        assert!(inner.terminate().is_none());
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut inner: CoreInner<u8> = CoreInner::new();
        assert!(matches!(
            inner.connect(Arc::new(1)),
            Err(SessionError::InvalidTransition { from: None, to: Running })
        ));
        assert!(inner.disconnect().is_err());

        inner.terminate();
        assert!(matches!(
            inner.open(TargetIdentity::new(1, 2), Arc::new(1)),
            Err(SessionError::InvalidTransition {
                from: Terminate,
                to: Opened
            })
        ));
        assert_eq!(inner.state(), Terminate);
    }

    #[test]
    fn test_stop_is_idempotent_and_drops_events() {
        let core: SessionCore<u8> = SessionCore::new();
        core.post(BackendEvent::Hotplug(common::HotplugEvent::Arrived {
            vendor_id: 1,
            product_id: 2,
        }));
        assert!(core.lock().has_events());

        assert!(core.stop());
        assert!(!core.stop());
        assert_eq!(core.state(), Terminate);
        assert!(!core.lock().has_events());

        core.post(BackendEvent::Hotplug(common::HotplugEvent::Left {
            vendor_id: 1,
            product_id: 2,
        }));
        assert!(!core.lock().has_events());
    }

    #[test]
    fn test_backoff_is_capped_and_resets() {
        let mut backoff = Backoff::new(&BackoffConfig {
            initial_ms: 10,
            max_ms: 80,
        });

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(11));

        let delays: Vec<_> = (0..10).map(|_| backoff.next_delay()).collect();
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(80)));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(80));

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(11));
    }
}
