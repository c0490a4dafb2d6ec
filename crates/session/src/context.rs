//! Process-wide transport library context
//!
//! Libraries such as hidapi and libusb need one initialisation per process.
//! [`SharedContext`] creates the context lazily on first use, hands out
//! reference-counted clones to every session of that transport kind, and
//! tears it down when the last clone is dropped. Its own lock serialises
//! creation and teardown.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

/// Lazily-initialised, reference-counted process-wide value
pub struct SharedContext<T> {
    name: &'static str,
    slot: Mutex<Option<Weak<T>>>,
}

impl<T> SharedContext<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    /// Return the live context, creating it with `init` if none exists
    ///
    /// `init` runs at most once per lifetime of the context, under the lock.
    pub fn acquire<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref().and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let context = Arc::new(init()?);
        *slot = Some(Arc::downgrade(&context));
        debug!("Initialized {} context", self.name);
        Ok(context)
    }

    /// Number of live references to the context
    pub fn live(&self) -> usize {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Weak::strong_count)
            .unwrap_or(0)
    }
}
