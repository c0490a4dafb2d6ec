//! User callbacks registered on a session
//!
//! Handlers are swapped atomically but dispatched outside every lock: the
//! reader clones the current `Arc` and calls it, so a replacement takes effect
//! on the next dispatch and a callback may call back into its session.

use common::{EventStream, SessionEvent, create_event_stream};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::error;

pub type DataHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type ConnectivityHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Current data and connectivity callbacks of one session
pub struct Handlers {
    data: Mutex<DataHandler>,
    connectivity: Mutex<ConnectivityHandler>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self::new()
    }
}

impl Handlers {
    /// Both handlers start as no-ops
    pub fn new() -> Self {
        let data: DataHandler = Arc::new(|_: &[u8]| {});
        let connectivity: ConnectivityHandler = Arc::new(|_: bool| {});
        Self {
            data: Mutex::new(data),
            connectivity: Mutex::new(connectivity),
        }
    }

    pub fn set_data<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    pub fn set_connectivity<F>(&self, handler: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        *self
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    /// Replace both handlers with forwarders into a new event stream
    pub fn subscribe(&self, capacity: usize) -> EventStream {
        let (sink, stream) = create_event_stream(capacity);
        let data_sink = sink.clone();
        self.set_data(move |bytes| {
            data_sink.publish(SessionEvent::Data(bytes.to_vec()));
        });
        self.set_connectivity(move |up| {
            sink.publish(SessionEvent::Connectivity(up));
        });
        stream
    }

    /// Invoke the data handler, containing any panic it raises
    pub fn dispatch_data(&self, bytes: &[u8]) {
        let handler = self
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if catch_unwind(AssertUnwindSafe(|| handler(bytes))).is_err() {
            error!("Panic in data handler ({} byte chunk dropped)", bytes.len());
        }
    }

    /// Invoke the connectivity handler, containing any panic it raises
    pub fn notify_connectivity(&self, connected: bool) {
        let handler = self
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if catch_unwind(AssertUnwindSafe(|| handler(connected))).is_err() {
            error!("Panic in connectivity handler (connected={})", connected);
        }
    }
}
