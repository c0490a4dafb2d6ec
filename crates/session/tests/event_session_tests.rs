//! Integration tests for EventSession
//!
//! Drives the event-driven session against MockUsbBackend:
//! - read completions: dispatch, re-arm, cancellation, device loss
//! - write path: acceptance, release, resubmission
//! - hot-plug registration and events
//! - teardown: pump join, transfer cancellation, close accounting

use common::{DeviceFilter, HotplugEvent, TargetIdentity, TransferStatus};
use session::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockTransport, MockUsbBackend, create_mock_descriptor, wait_until,
};
use session::{BackoffConfig, EventSession, SessionConfig, SessionError, SessionState};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn target() -> TargetIdentity {
    TargetIdentity::new(0x1234, 0x5678)
}

fn config_with_backoff(initial_ms: u64, max_ms: u64) -> SessionConfig {
    SessionConfig {
        pump_slice_ms: 5,
        backoff: BackoffConfig { initial_ms, max_ms },
        ..SessionConfig::default()
    }
}

fn backend() -> MockUsbBackend {
    MockUsbBackend::new(MockTransport::with_devices(vec![create_mock_descriptor(
        0x1234, 0x5678,
    )]))
}

fn session_with(backend: &MockUsbBackend) -> EventSession<MockUsbBackend> {
    EventSession::new(backend.clone(), config_with_backoff(1, 10))
}

#[derive(Clone, Default)]
struct Recorder {
    data: Arc<Mutex<Vec<Vec<u8>>>>,
    connectivity: Arc<Mutex<Vec<bool>>>,
}

impl Recorder {
    fn attach(&self, session: &EventSession<MockUsbBackend>) {
        let data = self.data.clone();
        session.on_data(move |bytes| data.lock().unwrap().push(bytes.to_vec()));
        let connectivity = self.connectivity.clone();
        session.on_connectivity(move |up| connectivity.lock().unwrap().push(up));
    }

    fn data(&self) -> Vec<Vec<u8>> {
        self.data.lock().unwrap().clone()
    }

    fn connectivity(&self) -> Vec<bool> {
        self.connectivity.lock().unwrap().clone()
    }
}

/// Start a session and wait until its first read is in flight
fn started(backend: &MockUsbBackend, recorder: &Recorder) -> EventSession<MockUsbBackend> {
    started_with(backend, recorder, config_with_backoff(1, 10))
}

fn started_with(
    backend: &MockUsbBackend,
    recorder: &Recorder,
    config: SessionConfig,
) -> EventSession<MockUsbBackend> {
    let session = EventSession::new(backend.clone(), config);
    recorder.attach(&session);
    session.start(target()).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        session.is_connected() && backend.pending_reads() == 1
    }));
    session
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_start_spawns_reader_and_pump() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = started(&backend, &recorder);

        assert_eq!(session.reader_threads(), 1);
        assert!(session.pump_running());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || backend.pumps() > 0));
        assert_eq!(recorder.connectivity(), vec![true]);

        session.start(target()).unwrap();
        assert_eq!(session.reader_threads(), 1);
        assert_eq!(backend.transport().opens(), 1);
    }

    #[test]
    fn test_failed_first_open_spawns_nothing() {
        let backend = backend();
        backend.transport().fail_next_opens(1);
        let session = session_with(&backend);

        assert!(matches!(
            session.start(target()),
            Err(SessionError::OpenFailed { .. })
        ));
        assert_eq!(session.state(), SessionState::None);
        assert_eq!(session.reader_threads(), 0);
        assert!(!session.pump_running());
    }

    #[test]
    fn test_stop_before_start() {
        let backend = backend();
        let session = session_with(&backend);

        session.stop();
        assert!(matches!(
            session.start(target()),
            Err(SessionError::Terminated)
        ));
        assert!(!session.pump_running());
        drop(session);
        assert_eq!(backend.transport().open_attempts(), 0);
    }

    #[test]
    fn test_stop_halts_pump_without_drop() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = started(&backend, &recorder);

        session.stop();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !session.pump_running()));
        assert_eq!(session.state(), SessionState::Terminate);
    }

    #[test]
    fn test_stop_racing_start_leaves_no_pump_running() {
        for _ in 0..25 {
            let backend = backend();
            let session = session_with(&backend);

            let started = std::thread::scope(|scope| {
                let starter = scope.spawn(|| session.start(target()));
                session.stop();
                starter.join().unwrap()
            });

            // Whichever side won, the session ends terminated with its pump halted
            assert!(started.is_ok() || matches!(started, Err(SessionError::Terminated)));
            assert_eq!(session.state(), SessionState::Terminate);
            assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !session.pump_running()));
        }
    }

    #[test]
    fn test_drop_joins_pump_and_cancels_transfers() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = started(&backend, &recorder);

        session.write(&[1, 2, 3]).unwrap();
        assert_eq!(backend.pending_writes(), 1);

        drop(session);

        assert_eq!(backend.pending_reads(), 0);
        assert_eq!(backend.pending_writes(), 0);
        assert_eq!(backend.cancels().len(), 2);
        assert_eq!(backend.transport().opens(), 1);
        assert_eq!(backend.transport().closes(), 1);

        let pumps = backend.pumps();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(backend.pumps(), pumps);
    }

    #[test]
    fn test_enumerate_applies_filter() {
        let backend = MockUsbBackend::new(MockTransport::with_devices(vec![
            create_mock_descriptor(0x1234, 0x0001),
            create_mock_descriptor(0x4321, 0x0001),
        ]));
        let session = session_with(&backend);

        let found = session
            .enumerate(&DeviceFilter::new(Some(0x4321), None))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vendor_id, 0x4321);
    }
}

mod reads {
    use super::*;

    #[test]
    fn test_completion_dispatches_and_rearms() {
        let backend = backend();
        let recorder = Recorder::default();
        let _session = started(&backend, &recorder);

        assert!(backend.complete_read(&[1, 2, 3]));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            recorder.data().len() == 1 && backend.pending_reads() == 1
        }));
        assert_eq!(recorder.data(), vec![vec![1, 2, 3]]);

        // the same transfer is re-armed
        let accepted = backend.accepted();
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0], accepted[1]);
    }

    #[test]
    fn test_empty_completion_rearms_without_dispatch() {
        let backend = backend();
        let recorder = Recorder::default();
        let _session = started(&backend, &recorder);

        assert!(backend.complete_read(&[]));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || backend.accepted().len() == 2));
        assert!(recorder.data().is_empty());
    }

    #[test]
    fn test_cancelled_read_is_not_resubmitted() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = started(&backend, &recorder);
        let first = backend.accepted()[0];

        assert!(backend.fail_read(TransferStatus::Cancelled));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || backend.pending_reads() == 1));

        let accepted = backend.accepted();
        assert_eq!(accepted.iter().filter(|id| **id == first).count(), 1);
        assert!(session.is_connected());
    }

    #[test]
    fn test_failed_read_is_rearmed_after_backoff() {
        let backend = backend();
        let recorder = Recorder::default();
        let _session = started(&backend, &recorder);
        let first = backend.accepted()[0];

        assert!(backend.fail_read(TransferStatus::Stall));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            backend.accepted().len() == 2 && backend.pending_reads() == 1
        }));
        assert_ne!(backend.accepted()[1], first);
        assert_eq!(recorder.connectivity(), vec![true]);
    }

    #[test]
    fn test_failing_read_waits_for_backoff() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = started_with(&backend, &recorder, config_with_backoff(400, 400));

        assert!(backend.fail_read(TransferStatus::Error("babble".into())));
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(backend.pending_reads(), 0);
        assert_eq!(backend.accepted().len(), 1);
        assert!(session.is_connected());

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            backend.accepted().len() == 2 && backend.pending_reads() == 1
        }));
    }

    #[test]
    fn test_repeated_failures_do_not_spin() {
        let backend = backend();
        let recorder = Recorder::default();
        let _session = started_with(&backend, &recorder, config_with_backoff(20, 200));

        let began = std::time::Instant::now();
        for expected in 2..=4 {
            assert!(backend.fail_read(TransferStatus::Stall));
            assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
                backend.accepted().len() == expected && backend.pending_reads() == 1
            }));
        }
        // 20 + 40 + 80ms
        assert!(began.elapsed() >= Duration::from_millis(140));
        assert_eq!(recorder.connectivity(), vec![true]);
    }

    #[test]
    fn test_completed_read_resets_backoff() {
        let backend = backend();
        let recorder = Recorder::default();
        let _session = started_with(&backend, &recorder, config_with_backoff(20, 2000));

        for expected in 2..=4 {
            assert!(backend.fail_read(TransferStatus::Stall));
            assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
                backend.accepted().len() == expected && backend.pending_reads() == 1
            }));
        }
        assert!(backend.complete_read(&[0x01]));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            backend.accepted().len() == 5 && backend.pending_reads() == 1
        }));

        let began = std::time::Instant::now();
        assert!(backend.fail_read(TransferStatus::Stall));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            backend.accepted().len() == 6 && backend.pending_reads() == 1
        }));
        assert!(began.elapsed() < Duration::from_millis(160));
        assert_eq!(recorder.data(), vec![vec![0x01]]);
    }

    #[test]
    fn test_no_device_closes_then_reopens() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = started(&backend, &recorder);

        assert!(backend.fail_read(TransferStatus::NoDevice));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            recorder.connectivity().len() == 3 && backend.pending_reads() == 1
        }));

        assert_eq!(recorder.connectivity(), vec![true, false, true]);
        assert!(session.is_connected());
        assert_eq!(backend.transport().opens(), 2);
        assert_eq!(backend.transport().closes(), 1);
    }

    #[test]
    fn test_reopen_backs_off_while_device_absent() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = started(&backend, &recorder);

        backend.transport().set_open_fails(true);
        assert!(backend.fail_read(TransferStatus::NoDevice));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            session.state() == SessionState::Closed && backend.transport().open_attempts() >= 4
        }));
        assert_eq!(backend.pending_reads(), 0);

        backend.transport().set_open_fails(false);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.is_connected()));
        assert_eq!(recorder.connectivity(), vec![true, false, true]);
    }

    #[test]
    fn test_submit_failures_are_retried() {
        let backend = backend();
        backend.fail_next_submits(2);
        let recorder = Recorder::default();
        let _session = started(&backend, &recorder);

        assert_eq!(backend.submits(), 3);
        assert_eq!(backend.accepted().len(), 1);
    }
}

mod writes {
    use super::*;

    #[test]
    fn test_write_validation() {
        let backend = backend();
        let session = session_with(&backend);
        assert!(matches!(session.write(&[1]), Err(SessionError::NotOpen)));

        session.start(target()).unwrap();
        assert!(matches!(
            session.write(&[]),
            Err(SessionError::InvalidParameter(_))
        ));

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || backend.pending_reads() == 1));
        backend.fail_next_submits(1);
        assert!(matches!(session.write(&[1]), Err(SessionError::Transfer(_))));
    }

    #[test]
    fn test_completed_write_is_released() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = started(&backend, &recorder);

        let id = session.write(&[0xde, 0xad]).unwrap();
        assert_eq!(backend.pending_writes(), 1);
        assert!(backend.complete_write(TransferStatus::Completed));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(backend.pending_writes(), 0);
        assert_eq!(backend.accepted().iter().filter(|a| **a == id).count(), 1);
    }

    #[test]
    fn test_failed_write_is_resubmitted() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = started(&backend, &recorder);

        let id = session.write(&[7; 16]).unwrap();
        assert!(backend.complete_write(TransferStatus::TimedOut));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || backend.pending_writes() == 1));
        assert_eq!(backend.accepted().iter().filter(|a| **a == id).count(), 2);

        assert!(backend.complete_write(TransferStatus::Completed));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(backend.pending_writes(), 0);
    }
}

mod hotplug {
    use super::*;

    #[test]
    fn test_unsupported_is_reported_and_non_fatal() {
        let backend = backend();
        backend.set_hotplug_supported(false);
        let recorder = Recorder::default();
        let session = started(&backend, &recorder);

        assert!(matches!(
            session.enable_hotplug(),
            Err(SessionError::Unsupported(_))
        ));
        assert!(session.is_connected());
        assert!(backend.complete_read(&[5]));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || recorder.data().len() == 1));
    }

    #[test]
    fn test_enable_requires_started_session() {
        let backend = backend();
        let session = session_with(&backend);
        assert!(matches!(
            session.enable_hotplug(),
            Err(SessionError::NotOpen)
        ));
    }

    #[test]
    fn test_enable_after_stop_is_terminated() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = started(&backend, &recorder);

        session.stop();
        assert!(matches!(
            session.enable_hotplug(),
            Err(SessionError::Terminated)
        ));
        assert!(!backend.hotplug_registered());
    }

    #[test]
    fn test_left_and_arrived_drive_reconnect() {
        let backend = backend();
        let recorder = Recorder::default();
        let session = EventSession::new(backend.clone(), config_with_backoff(5_000, 5_000));
        recorder.attach(&session);
        session.start(target()).unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.is_connected()));

        session.enable_hotplug().unwrap();
        assert!(backend.hotplug_registered());

        backend.transport().set_open_fails(true);
        assert!(backend.emit_hotplug(HotplugEvent::Left {
            vendor_id: 0x1234,
            product_id: 0x5678,
        }));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            session.state() == SessionState::Closed && backend.transport().open_attempts() == 2
        }));
        assert_eq!(recorder.connectivity(), vec![true, false]);

        // the next scheduled retry is seconds away; arrival skips it
        backend.transport().set_open_fails(false);
        assert!(backend.emit_hotplug(HotplugEvent::Arrived {
            vendor_id: 0x1234,
            product_id: 0x5678,
        }));
        assert!(wait_until(Duration::from_secs(1), || session.is_connected()));
        assert_eq!(recorder.connectivity(), vec![true, false, true]);

        drop(session);
        assert!(!backend.hotplug_registered());
    }
}
