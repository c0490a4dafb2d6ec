//! Messages exchanged between transport backends, session reader threads and
//! async consumers
//!
//! Backends never call user code. They post [`BackendEvent`]s to the session,
//! and the session's reader thread decides what to dispatch. Consumers that
//! prefer a stream over callbacks receive [`SessionEvent`]s through an
//! [`EventStream`].

use async_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier assigned to a transfer when it is first submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Endpoint transfer type used for data transfers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    #[default]
    Bulk,
    Interrupt,
}

/// An asynchronous transfer handed to a backend
///
/// For IN endpoints `buffer.len()` is the receive capacity. For OUT
/// endpoints `buffer` holds the bytes to send. The same request is handed
/// back in its [`Completion`] so it can be re-armed without reallocating.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: TransferId,
    pub kind: TransferKind,
    pub endpoint: u8,
    pub buffer: Vec<u8>,
    pub timeout: Duration,
}

impl TransferRequest {
    /// Whether the endpoint address has the IN direction bit set
    pub fn is_in(&self) -> bool {
        (self.endpoint & 0x80) != 0
    }
}

/// Final status of one submission of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    TimedOut,
    /// Endpoint halted
    Stall,
    NoDevice,
    Error(String),
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Completed)
    }
}

/// A finished transfer, posted by the backend to the owning session
#[derive(Debug, Clone)]
pub struct Completion {
    pub request: TransferRequest,
    pub status: TransferStatus,
    /// Bytes actually moved (received bytes sit in `request.buffer[..actual_length]`)
    pub actual_length: usize,
}

impl Completion {
    /// Received payload for IN transfers
    pub fn payload(&self) -> &[u8] {
        let len = self.actual_length.min(self.request.buffer.len());
        &self.request.buffer[..len]
    }
}

/// Attach/detach notification from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived { vendor_id: u16, product_id: u16 },
    Left { vendor_id: u16, product_id: u16 },
}

/// Everything a backend can post to a session
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Transfer(Completion),
    Hotplug(HotplugEvent),
}

/// Event delivered to stream subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// One inbound chunk
    Data(Vec<u8>),
    /// Connection became usable (`true`) or was lost (`false`)
    Connectivity(bool),
}

/// Sending half held by the session's registered handlers
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<SessionEvent>,
}

impl EventSink {
    /// Publish an event without blocking the reader thread
    ///
    /// Returns `false` when the event was dropped because the stream is full
    /// or closed.
    pub fn publish(&self, event: SessionEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Session event stream full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half for async or blocking consumers
#[derive(Clone)]
pub struct EventStream {
    rx: Receiver<SessionEvent>,
}

impl EventStream {
    /// Receive the next event (async)
    pub async fn recv(&self) -> crate::Result<SessionEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event (blocking)
    pub fn recv_blocking(&self) -> crate::Result<SessionEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of events waiting in the stream
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a bounded event stream
///
/// Returns (EventSink for the session, EventStream for the consumer)
pub fn create_event_stream(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = bounded(capacity.max(1));
    (EventSink { tx }, EventStream { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_stream_from_thread() {
        let (sink, stream) = create_event_stream(8);

        let handle = std::thread::spawn(move || {
            sink.publish(SessionEvent::Connectivity(true));
            sink.publish(SessionEvent::Data(vec![1, 2, 3]))
        });

        assert_eq!(
            stream.recv().await.unwrap(),
            SessionEvent::Connectivity(true)
        );
        assert_eq!(
            stream.recv().await.unwrap(),
            SessionEvent::Data(vec![1, 2, 3])
        );
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_full_stream_drops() {
        let (sink, stream) = create_event_stream(1);
        assert!(sink.publish(SessionEvent::Connectivity(true)));
        assert!(!sink.publish(SessionEvent::Connectivity(false)));
        assert_eq!(stream.len(), 1);
        assert_eq!(stream.try_recv(), Some(SessionEvent::Connectivity(true)));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_closed_stream_reports_drop() {
        let (sink, stream) = create_event_stream(4);
        drop(stream);
        assert!(sink.is_closed());
        assert!(!sink.publish(SessionEvent::Data(vec![0])));
    }

    #[test]
    fn test_completion_payload_is_clamped() {
        let completion = Completion {
            request: TransferRequest {
                id: TransferId(1),
                kind: TransferKind::Interrupt,
                endpoint: 0x81,
                buffer: vec![9, 8, 7, 6],
                timeout: Duration::from_millis(10),
            },
            status: TransferStatus::Completed,
            actual_length: 2,
        };
        assert!(completion.request.is_in());
        assert_eq!(completion.payload(), &[9, 8]);

        let overlong = Completion {
            actual_length: 99,
            ..completion
        };
        assert_eq!(overlong.payload().len(), 4);
    }
}
