//! Event pump thread
//!
//! Dedicated thread that keeps a backend's event loop turning. It owns
//! nothing but its stop flag and a reference to the backend; everything the
//! backend produces is posted to sessions, never handled here.

use crate::error::Result;
use crate::transport::AsyncTransport;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause after a failed pump slice before trying again
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Handle to a running event pump; stops and joins the thread on drop
pub struct EventPump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Spawn a thread calling `backend.pump_events(slice)` until stopped
    pub fn spawn<B: AsyncTransport>(name: String, backend: Arc<B>, slice: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || run(&*backend, &flag, slice))?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Ask the thread to exit after its current slice
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("Event pump thread panicked");
        }
    }
}

fn run<B: AsyncTransport>(backend: &B, stop: &AtomicBool, slice: Duration) {
    info!("Event pump started");

    while !stop.load(Ordering::SeqCst) {
        match backend.pump_events(slice) {
            Ok(()) => {}
            Err(e) => {
                // Never fatal: the session decides about device loss
                warn!("Error handling transport events: {}", e);
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    debug!("Event pump observed stop flag");
    info!("Event pump stopped");
}
