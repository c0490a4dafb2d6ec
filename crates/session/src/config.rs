//! Session tuning parameters

use common::TransferKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by polling and event-driven sessions
///
/// Every field has a default so partial TOML tables are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Receive buffer size for the polling reader
    pub read_buffer_size: usize,
    /// Upper bound on one blocking poll read, so `stop()` is observed promptly
    pub read_poll_interval_ms: u64,
    /// Timeout passed to every transfer call
    pub transfer_timeout_ms: u64,
    /// Attempts for synchronous transfers that stall
    pub max_retry_count: u32,
    /// Delay between failed open/submit attempts
    pub backoff: BackoffConfig,
    /// Upper bound on one event pump slice
    pub pump_slice_ms: u64,
    /// HID output report size used to chunk writes
    pub max_report_size: usize,
    /// Receive buffer size of each asynchronous read transfer
    pub async_buffer_size: usize,
    /// Number of read transfers kept in flight
    pub in_flight_reads: usize,
    /// Transfer type used for asynchronous reads and writes
    pub transfer_kind: TransferKind,
    /// Capacity of streams created by `subscribe`
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            read_poll_interval_ms: 100,
            transfer_timeout_ms: 3000,
            max_retry_count: 3,
            backoff: BackoffConfig::default(),
            pump_slice_ms: 3000,
            max_report_size: 1024,
            async_buffer_size: 64,
            in_flight_reads: 1,
            transfer_kind: TransferKind::Bulk,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_interval_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn pump_slice(&self) -> Duration {
        Duration::from_millis(self.pump_slice_ms)
    }
}

/// Capped exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 10,
            max_ms: 2000,
        }
    }
}
