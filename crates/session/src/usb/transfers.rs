//! Synchronous USB transfers
//!
//! Blocking bulk, interrupt and control transfers on an open device. A
//! stalled endpoint is retried a bounded number of times; every other
//! failure is returned after the first attempt.

use crate::config::SessionConfig;
use crate::error::{Result, SessionError, TransportError};
use crate::transport::{ControlRequest, Transport, UsbIo};
use common::{TargetIdentity, TransferKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Run `op` until it succeeds, fails with a non-stall error, or has been
/// attempted `max_attempts` times
pub fn with_stall_retry<T>(
    max_attempts: u32,
    mut op: impl FnMut() -> std::result::Result<T, TransportError>,
) -> std::result::Result<T, TransportError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_stall() && attempt < max_attempts => {
                debug!("Endpoint stalled (attempt {}/{}), retrying", attempt, max_attempts);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Blocking transfers against one open USB device
pub struct SyncUsbDevice<H: UsbIo> {
    handle: Arc<H>,
    timeout: Duration,
    max_attempts: u32,
}

impl<H: UsbIo> SyncUsbDevice<H> {
    /// Open `identity` through `transport`
    pub fn open<T>(transport: &T, identity: &TargetIdentity, config: &SessionConfig) -> Result<Self>
    where
        T: Transport<Handle = H>,
    {
        let handle = transport
            .open(identity)
            .map_err(|source| SessionError::OpenFailed {
                target: identity.to_string(),
                source,
            })?;
        Ok(Self::new(Arc::new(handle), config))
    }

    /// Wrap an already-open handle
    pub fn new(handle: Arc<H>, config: &SessionConfig) -> Self {
        Self {
            handle,
            timeout: config.transfer_timeout(),
            max_attempts: config.max_retry_count,
        }
    }

    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }

    pub fn send_bulk(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        self.send(TransferKind::Bulk, endpoint, data)
    }

    pub fn recv_bulk(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        self.recv(TransferKind::Bulk, endpoint, buf)
    }

    pub fn send_interrupt(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        self.send(TransferKind::Interrupt, endpoint, data)
    }

    pub fn recv_interrupt(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        self.recv(TransferKind::Interrupt, endpoint, buf)
    }

    /// Host-to-device control transfer
    pub fn send_control(&self, request: ControlRequest, data: &[u8]) -> Result<usize> {
        if request.is_in() {
            return Err(SessionError::InvalidParameter(
                "device-to-host request type on send_control",
            ));
        }
        self.attempt("control OUT", || {
            self.handle.write_control(request, data, self.timeout)
        })
    }

    /// Device-to-host control transfer
    pub fn recv_control(&self, request: ControlRequest, buf: &mut [u8]) -> Result<usize> {
        if !request.is_in() {
            return Err(SessionError::InvalidParameter(
                "host-to-device request type on recv_control",
            ));
        }
        self.attempt("control IN", || {
            self.handle.read_control(request, buf, self.timeout)
        })
    }

    fn send(&self, kind: TransferKind, endpoint: u8, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(SessionError::InvalidParameter("empty write buffer"));
        }
        self.attempt("OUT", || self.handle.write(kind, endpoint, data, self.timeout))
    }

    fn recv(&self, kind: TransferKind, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(SessionError::InvalidParameter("empty read buffer"));
        }
        self.attempt("IN", || self.handle.read(kind, endpoint, buf, self.timeout))
    }

    fn attempt(
        &self,
        what: &str,
        op: impl FnMut() -> std::result::Result<usize, TransportError>,
    ) -> Result<usize> {
        with_stall_retry(self.max_attempts, op).map_err(|e| {
            warn!("{} transfer failed: {}", what, e);
            SessionError::Transfer(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn scripted(
        script: Vec<std::result::Result<usize, TransportError>>,
    ) -> (Cell<usize>, impl Fn(&Cell<usize>) -> std::result::Result<usize, TransportError>) {
        (Cell::new(0), move |calls: &Cell<usize>| {
            let n = calls.get();
            calls.set(n + 1);
            script[n.min(script.len() - 1)].clone()
        })
    }

    #[test]
    fn test_stall_twice_then_success() {
        let (calls, op) = scripted(vec![
            Err(TransportError::Stall),
            Err(TransportError::Stall),
            Ok(8),
        ]);
        assert_eq!(with_stall_retry(3, || op(&calls)), Ok(8));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_stall_exhausts_attempts() {
        let (calls, op) = scripted(vec![Err(TransportError::Stall)]);
        assert_eq!(with_stall_retry(3, || op(&calls)), Err(TransportError::Stall));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_non_stall_is_not_retried() {
        let (calls, op) = scripted(vec![Err(TransportError::Timeout), Ok(1)]);
        assert_eq!(with_stall_retry(3, || op(&calls)), Err(TransportError::Timeout));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let (calls, op) = scripted(vec![Ok(2)]);
        assert_eq!(with_stall_retry(0, || op(&calls)), Ok(2));
        assert_eq!(calls.get(), 1);
    }
}
