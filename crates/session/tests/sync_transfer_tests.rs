//! Integration tests for SyncUsbDevice
//!
//! Stall-class failures are retried up to `max_retry_count` attempts; every
//! other failure is returned after a single attempt.

use common::TargetIdentity;
use session::test_utils::MockTransport;
use session::{ControlRequest, SessionConfig, SessionError, SyncUsbDevice, TransportError};

fn open(transport: &MockTransport) -> SyncUsbDevice<session::test_utils::MockHandle> {
    SyncUsbDevice::open(
        transport,
        &TargetIdentity::new(0x1234, 0x5678),
        &SessionConfig::default(),
    )
    .unwrap()
}

#[test]
fn test_stall_twice_then_success() {
    let transport = MockTransport::new();
    let device = open(&transport);
    transport.push_transfer_result(Err(TransportError::Stall));
    transport.push_transfer_result(Err(TransportError::Stall));
    transport.push_transfer_result(Ok(4));

    assert_eq!(device.send_bulk(0x01, &[1, 2, 3, 4]).unwrap(), 4);
    assert_eq!(transport.transfer_attempts(), 3);
    assert_eq!(transport.writes(), vec![vec![1, 2, 3, 4]]);
}

#[test]
fn test_stall_three_times_fails() {
    let transport = MockTransport::new();
    let device = open(&transport);
    for _ in 0..3 {
        transport.push_transfer_result(Err(TransportError::Stall));
    }

    let mut buf = [0u8; 8];
    let err = device.recv_interrupt(0x81, &mut buf).unwrap_err();
    assert!(matches!(err, SessionError::Transfer(TransportError::Stall)));
    assert_eq!(transport.transfer_attempts(), 3);
}

#[test]
fn test_non_stall_error_is_not_retried() {
    let transport = MockTransport::new();
    let device = open(&transport);
    transport.push_transfer_result(Err(TransportError::Timeout));

    let mut buf = [0u8; 8];
    let err = device.recv_bulk(0x81, &mut buf).unwrap_err();
    assert!(matches!(err, SessionError::Transfer(TransportError::Timeout)));
    assert_eq!(transport.transfer_attempts(), 1);
}

#[test]
fn test_retry_count_follows_config() {
    let transport = MockTransport::new();
    let config = SessionConfig {
        max_retry_count: 5,
        ..SessionConfig::default()
    };
    let device = SyncUsbDevice::open(&transport, &TargetIdentity::new(1, 2), &config).unwrap();
    for _ in 0..4 {
        transport.push_transfer_result(Err(TransportError::Stall));
    }

    assert!(device.send_interrupt(0x02, &[9]).is_ok());
    assert_eq!(transport.transfer_attempts(), 5);
}

#[test]
fn test_control_direction_is_checked() {
    let transport = MockTransport::new();
    let device = open(&transport);
    let get_status = ControlRequest {
        request_type: 0x80,
        request: 0x00,
        value: 0,
        index: 0,
    };
    let set_feature = ControlRequest {
        request_type: 0x00,
        request: 0x03,
        value: 1,
        index: 0,
    };

    let mut buf = [0u8; 2];
    assert_eq!(device.recv_control(get_status, &mut buf).unwrap(), 2);
    assert_eq!(device.send_control(set_feature, &[]).unwrap(), 0);

    assert!(matches!(
        device.send_control(get_status, &[]),
        Err(SessionError::InvalidParameter(_))
    ));
    assert!(matches!(
        device.recv_control(set_feature, &mut buf),
        Err(SessionError::InvalidParameter(_))
    ));
}

#[test]
fn test_open_failure_is_reported() {
    let transport = MockTransport::new();
    transport.fail_next_opens(1);

    let result = SyncUsbDevice::open(
        &transport,
        &TargetIdentity::new(0x1234, 0x5678),
        &SessionConfig::default(),
    );
    assert!(matches!(result, Err(SessionError::OpenFailed { .. })));
}

#[test]
fn test_handle_closes_with_device() {
    let transport = MockTransport::new();
    let device = open(&transport);
    assert_eq!(transport.open_handles(), 1);
    drop(device);
    assert_eq!(transport.closes(), 1);
}
