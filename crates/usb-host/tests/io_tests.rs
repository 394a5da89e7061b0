//! Integration tests for USB request submission
//!
//! Run with: cargo test -p usb-host --test io_tests

use common::Error;
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, create_cdc_config, create_mock_device_descriptor, with_timeout,
};
use protocol::{ControlSetup, DeviceAddress, PipeDirection, Recipient, RequestKind};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use usb_host::test_utils::MockTransport;
use usb_host::{
    ClaimedInterface, CompletionStatus, InterfaceHandle, RequestData, RequestParams, RequestState,
    SessionSettings, UsbRequest, UsbSession,
};

const ADDRESS: DeviceAddress = DeviceAddress { bus: 1, device: 4 };
const BULK_IN: u8 = 0x81;
const BULK_OUT: u8 = 0x02;
const DATA_INTERFACE: u8 = 1;

struct Fixture {
    transport: Arc<MockTransport>,
    session: UsbSession,
    claimed: ClaimedInterface,
    handle: Option<InterfaceHandle>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_settings(&SessionSettings::default())
    }

    /// Data interface claimed, opened and switched to its bulk alt setting
    fn with_settings(settings: &SessionSettings) -> Self {
        let transport = Arc::new(MockTransport::new());
        transport.add_device(
            ADDRESS,
            create_mock_device_descriptor(0x1234, 0x0001),
            create_cdc_config(),
        );
        let session = UsbSession::new(transport.clone(), settings);
        let claimed = session.claim_interface(ADDRESS, DATA_INTERFACE).unwrap();
        let handle = session.open_interface(&claimed).unwrap();
        session.select_interface_setting(&handle, 1).unwrap();
        Self {
            transport,
            session,
            claimed,
            handle: Some(handle),
        }
    }

    fn handle(&self) -> &InterfaceHandle {
        self.handle.as_ref().unwrap()
    }

    fn request(&self, length: usize) -> UsbRequest {
        self.session.alloc_request(self.handle(), 0, length).unwrap()
    }

    fn fill_out(&self, request: &UsbRequest, payload: &[u8]) {
        self.session
            .fill_request(request, self.handle(), bulk_params(2, payload.to_vec(), 0))
            .unwrap();
    }

    fn fill_in(&self, request: &UsbRequest, length: usize, timeout: Duration) {
        let mut params = bulk_params(1, Vec::new(), length);
        params.timeout = timeout;
        self.session
            .fill_request(request, self.handle(), params)
            .unwrap();
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.session.close_interface(handle).unwrap();
        }
    }

    fn teardown(mut self) {
        self.close();
        self.session.release_interface(&self.claimed).unwrap();
        assert_eq!(self.session.pool_count(), 0);
    }
}

fn bulk_params(pipe_id: u8, payload: Vec<u8>, length: usize) -> RequestParams {
    RequestParams {
        interface_number: DATA_INTERFACE,
        pipe_id,
        timeout: Duration::from_secs(1),
        data: RequestData::Data { payload, length },
    }
}

fn wait_for_state(request: &UsbRequest, state: RequestState) {
    let deadline = Instant::now() + DEFAULT_TEST_TIMEOUT;
    while request.state() != state {
        assert!(Instant::now() < deadline, "request never reached {:?}", state);
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Synchronous submission
// ============================================================================

mod sync_io {
    use super::*;

    #[test]
    fn test_bulk_out_and_in() {
        let fx = Fixture::new();

        let out = fx.request(512);
        fx.fill_out(&out, b"AT\r\n");
        let completion = out.submit_sync(None).unwrap();
        assert!(completion.is_success());
        assert_eq!(completion.actual_length, 4);
        assert!(completion.data.is_empty());
        assert_eq!(fx.transport.written(BULK_OUT), vec![b"AT\r\n".to_vec()]);

        fx.transport.push_in_data(BULK_IN, b"OK\r\n".to_vec());
        let input = fx.request(512);
        fx.fill_in(&input, 64, Duration::from_secs(1));
        let completion = input.submit_sync(None).unwrap();
        assert!(completion.is_success());
        assert_eq!(completion.data, b"OK\r\n");
        assert_eq!(input.state(), RequestState::Completed);
        assert_eq!(input.last_completion().unwrap().actual_length, 4);

        let metrics = fx.handle().pool().metrics();
        assert_eq!(metrics.submitted, 2);
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.bytes_transferred, 8);
        assert_eq!(metrics.failed, 0);

        out.free().unwrap();
        input.free().unwrap();
        fx.teardown();
    }

    #[test]
    fn test_resubmit_completed_request() {
        let fx = Fixture::new();
        fx.transport.push_in_data(BULK_IN, vec![1]);
        fx.transport.push_in_data(BULK_IN, vec![2, 3]);

        let request = fx.request(64);
        fx.fill_in(&request, 64, Duration::from_secs(1));
        assert_eq!(request.submit_sync(None).unwrap().data, vec![1]);
        assert_eq!(request.submit_sync(None).unwrap().data, vec![2, 3]);

        request.free().unwrap();
        fx.teardown();
    }

    #[test]
    fn test_in_without_data_times_out() {
        let fx = Fixture::new();

        let request = fx.request(64);
        fx.fill_in(&request, 64, Duration::from_millis(10));
        let completion = request.submit_sync(None).unwrap();
        assert_eq!(completion.status, CompletionStatus::TimedOut);
        assert_eq!(completion.actual_length, 0);
        assert_eq!(fx.handle().pool().metrics().failed, 1);

        request.free().unwrap();
        fx.teardown();
    }

    #[test]
    fn test_sync_timeout_cancels_request() {
        let fx = Fixture::new();
        fx.transport.stall_endpoint(BULK_IN);

        let request = fx.request(64);
        fx.fill_in(&request, 64, Duration::from_secs(2));
        let result = request.submit_sync(Some(Duration::from_millis(100)));
        assert!(matches!(result, Err(Error::Timeout(_))));

        wait_for_state(&request, RequestState::Completed);
        assert_eq!(
            request.last_completion().unwrap().status,
            CompletionStatus::Cancelled
        );
        request.free().unwrap();
        fx.teardown();
    }

    #[test]
    fn test_session_sync_timeout() {
        let settings = SessionSettings {
            sync_timeout_ms: Some(100),
            ..Default::default()
        };
        let fx = Fixture::with_settings(&settings);
        fx.transport.stall_endpoint(BULK_IN);

        let request = fx.request(64);
        fx.fill_in(&request, 64, Duration::ZERO);
        let started = Instant::now();
        assert!(matches!(
            fx.session.submit_request_sync(&request),
            Err(Error::Timeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));

        wait_for_state(&request, RequestState::Completed);
        request.free().unwrap();
        fx.teardown();
    }
}

// ============================================================================
// Asynchronous submission
// ============================================================================

mod async_io {
    use super::*;

    #[test]
    fn test_callback_runs_on_completion() {
        let fx = Fixture::new();
        fx.transport.push_in_data(BULK_IN, vec![0xAA; 16]);

        let request = fx.request(64);
        fx.fill_in(&request, 64, Duration::from_secs(1));
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();
        request
            .submit_async(move |completion| {
                let _ = tx.send((completion.clone(), std::thread::current().id()));
            })
            .unwrap();

        let (completion, thread) = rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
        assert!(completion.is_success());
        assert_eq!(completion.request_id, request.id());
        assert_eq!(completion.data, vec![0xAA; 16]);
        assert_ne!(thread, caller);

        request.free().unwrap();
        fx.teardown();
    }

    #[tokio::test]
    async fn test_notify_channel() {
        let fx = Fixture::new();

        let request = fx.request(512);
        fx.fill_out(&request, &[0x55; 100]);
        let rx = request.submit_async_notify().unwrap();

        let completion = with_timeout(DEFAULT_TEST_TIMEOUT, rx)
            .await
            .unwrap()
            .unwrap();
        assert!(completion.is_success());
        assert_eq!(completion.actual_length, 100);

        request.free().unwrap();
        fx.teardown();
    }

    #[test]
    fn test_double_submit_rejected() {
        let fx = Fixture::new();
        fx.transport.stall_endpoint(BULK_IN);

        let request = fx.request(64);
        fx.fill_in(&request, 64, Duration::ZERO);
        let (tx, rx) = mpsc::channel();
        request
            .submit_async(move |completion| {
                let _ = tx.send(completion.status.clone());
            })
            .unwrap();
        assert!(matches!(
            request.submit_async(|_| {}),
            Err(Error::InvalidParameter(_))
        ));

        fx.transport.unstall_endpoint(BULK_IN);
        assert_eq!(
            rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap(),
            CompletionStatus::Success
        );

        request.free().unwrap();
        fx.teardown();
    }

    #[test]
    fn test_panicking_callback_keeps_worker_alive() {
        let fx = Fixture::new();

        let first = fx.request(64);
        fx.fill_out(&first, &[1, 2, 3]);
        first
            .submit_async(|_| panic!("driver callback failure"))
            .unwrap();

        let second = fx.request(64);
        fx.fill_out(&second, &[4, 5, 6]);
        let (tx, rx) = mpsc::channel();
        second
            .submit_async(move |completion| {
                let _ = tx.send(completion.actual_length);
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap(), 3);

        fx.teardown();
    }
}

// ============================================================================
// Cancellation and freeing
// ============================================================================

mod cancel {
    use super::*;

    #[test]
    fn test_cancel_queued_and_in_flight() {
        let fx = Fixture::new();
        fx.transport.stall_endpoint(BULK_IN);
        let (tx, rx) = mpsc::channel();

        let running = fx.request(64);
        fx.fill_in(&running, 64, Duration::ZERO);
        let sender = tx.clone();
        running
            .submit_async(move |c| {
                let _ = sender.send((c.request_id, c.status.clone()));
            })
            .unwrap();
        wait_for_state(&running, RequestState::InFlight);

        let queued = fx.request(64);
        fx.fill_in(&queued, 64, Duration::ZERO);
        queued
            .submit_async(move |c| {
                let _ = tx.send((c.request_id, c.status.clone()));
            })
            .unwrap();
        assert_eq!(queued.state(), RequestState::Pending);

        assert!(matches!(
            queued.clone().free(),
            Err(Error::InvariantViolation(_))
        ));

        queued.cancel().unwrap();
        running.cancel().unwrap();

        let mut outcomes = vec![
            rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap(),
            rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap(),
        ];
        outcomes.sort_by_key(|(id, _)| *id == queued.id());
        assert_eq!(outcomes[0], (running.id(), CompletionStatus::Cancelled));
        assert_eq!(outcomes[1], (queued.id(), CompletionStatus::Cancelled));
        assert_eq!(fx.handle().pool().metrics().cancelled, 2);

        running.free().unwrap();
        queued.free().unwrap();
        fx.teardown();
    }

    #[test]
    fn test_cancel_idle_request() {
        let fx = Fixture::new();

        let request = fx.request(64);
        assert!(matches!(request.cancel(), Err(Error::InvalidParameter(_))));
        fx.fill_out(&request, &[0]);
        assert!(matches!(request.cancel(), Err(Error::InvalidParameter(_))));

        request.free().unwrap();
        fx.teardown();
    }
}

// ============================================================================
// Queue backpressure
// ============================================================================

mod backpressure {
    use super::*;

    #[test]
    fn test_full_queue_does_not_block_handles() {
        let settings = SessionSettings {
            io_queue_depth: 1,
            ..SessionSettings::default()
        };
        let fx = Fixture::with_settings(&settings);
        fx.transport.stall_endpoint(BULK_IN);
        let (tx, rx) = mpsc::channel();

        let requests: Vec<UsbRequest> = (0..3)
            .map(|_| {
                let request = fx.request(64);
                fx.fill_in(&request, 64, Duration::from_millis(300));
                request
            })
            .collect();

        let sender = tx.clone();
        requests[0]
            .submit_async(move |c| {
                let _ = sender.send(c.request_id);
            })
            .unwrap();
        wait_for_state(&requests[0], RequestState::InFlight);
        let sender = tx.clone();
        requests[1]
            .submit_async(move |c| {
                let _ = sender.send(c.request_id);
            })
            .unwrap();

        let blocked = requests[2].clone();
        let submitter = std::thread::spawn(move || {
            blocked.submit_async(move |c| {
                let _ = tx.send(c.request_id);
            })
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!submitter.is_finished());

        let start = Instant::now();
        let second = fx.session.open_interface(&fx.claimed).unwrap();
        fx.session.close_interface(second).unwrap();
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "opening a handle waited {:?} on a full submit queue",
            start.elapsed()
        );

        submitter.join().unwrap().unwrap();
        let mut completed: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap())
            .collect();
        completed.sort_unstable();
        let mut expected: Vec<u32> = requests.iter().map(|r| r.id()).collect();
        expected.sort_unstable();
        assert_eq!(completed, expected);

        for request in requests {
            request.free().unwrap();
        }
        fx.teardown();
    }

    #[test]
    fn test_waiting_submit_fails_when_queues_stop() {
        let settings = SessionSettings {
            io_queue_depth: 1,
            ..SessionSettings::default()
        };
        let mut fx = Fixture::with_settings(&settings);
        fx.transport.stall_endpoint(BULK_IN);

        let requests: Vec<UsbRequest> = (0..3)
            .map(|_| {
                let request = fx.request(64);
                fx.fill_in(&request, 64, Duration::from_millis(200));
                request
            })
            .collect();
        requests[0].submit_async(|_| {}).unwrap();
        wait_for_state(&requests[0], RequestState::InFlight);
        requests[1].submit_async(|_| {}).unwrap();

        let blocked = requests[2].clone();
        let submitter = std::thread::spawn(move || blocked.submit_async(|_| {}));
        std::thread::sleep(Duration::from_millis(50));

        fx.close();
        assert!(matches!(
            submitter.join().unwrap(),
            Err(Error::Channel(_))
        ));
        assert_eq!(requests[2].state(), RequestState::Filled);

        for request in requests {
            request.free().unwrap();
        }
        fx.teardown();
    }
}

// ============================================================================
// Fill validation
// ============================================================================

mod fill {
    use super::*;

    fn vendor_setup(direction: PipeDirection, length: u16) -> ControlSetup {
        ControlSetup {
            direction,
            kind: RequestKind::Vendor,
            recipient: Recipient::Device,
            request: 0x01,
            value: 0,
            index: 0,
            length,
        }
    }

    #[test]
    fn test_unfilled_submit_rejected() {
        let fx = Fixture::new();
        let request = fx.request(64);
        assert_eq!(request.state(), RequestState::Idle);
        assert!(matches!(
            request.submit_sync(None),
            Err(Error::InvalidParameter(_))
        ));
        request.free().unwrap();
        fx.teardown();
    }

    #[test]
    fn test_mismatched_parameters_rejected() {
        let fx = Fixture::new();
        let request = fx.request(8);

        let control_on_bulk = RequestParams {
            interface_number: DATA_INTERFACE,
            pipe_id: 2,
            timeout: Duration::from_secs(1),
            data: RequestData::Control {
                setup: vendor_setup(PipeDirection::Out, 0),
                payload: Vec::new(),
            },
        };
        assert!(matches!(
            fx.session.fill_request(&request, fx.handle(), control_on_bulk),
            Err(Error::InvalidParameter(_))
        ));

        // larger than the 8-byte buffer
        assert!(matches!(
            fx.session
                .fill_request(&request, fx.handle(), bulk_params(2, vec![0; 9], 0)),
            Err(Error::InvalidParameter(_))
        ));

        assert!(matches!(
            fx.session
                .fill_request(&request, fx.handle(), bulk_params(7, vec![0], 0)),
            Err(Error::NotFound(_))
        ));
        assert_eq!(request.state(), RequestState::Idle);

        request.free().unwrap();
        fx.teardown();
    }

    #[test]
    fn test_submit_after_close_rejected() {
        let mut fx = Fixture::new();
        let request = fx.request(64);
        fx.fill_out(&request, &[1]);

        fx.close();
        assert!(matches!(
            request.submit_sync(None),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(request.state(), RequestState::Filled);

        request.free().unwrap();
        fx.teardown();
    }
}

// ============================================================================
// Control transfers
// ============================================================================

mod control {
    use super::*;
    use usb_host::CONTROL_PIPE_ID;

    const CONTROL_INTERFACE: u8 = 0xFF;

    fn control_params(setup: ControlSetup, payload: Vec<u8>) -> RequestParams {
        RequestParams {
            interface_number: CONTROL_INTERFACE,
            pipe_id: CONTROL_PIPE_ID,
            timeout: Duration::from_secs(1),
            data: RequestData::Control { setup, payload },
        }
    }

    fn setup(direction: PipeDirection, request: u8, length: u16) -> ControlSetup {
        ControlSetup {
            direction,
            kind: RequestKind::Class,
            recipient: Recipient::Interface,
            request,
            value: 0,
            index: 0,
            length,
        }
    }

    #[test]
    fn test_control_out_and_in() {
        let transport = Arc::new(MockTransport::new());
        transport.add_device(
            ADDRESS,
            create_mock_device_descriptor(0x1234, 0x0001),
            create_cdc_config(),
        );
        let session = UsbSession::new(transport.clone(), &SessionSettings::default());
        let claimed = session.claim_interface(ADDRESS, CONTROL_INTERFACE).unwrap();
        let handle = session.open_interface(&claimed).unwrap();

        // SET_LINE_CODING: 115200 8N1
        let line_coding = vec![0x00, 0xC2, 0x01, 0x00, 0x00, 0x00, 0x08];
        let out = session.alloc_request(&handle, 0, 64).unwrap();
        let set_line = setup(PipeDirection::Out, 0x20, 7);
        session
            .fill_request(&out, &handle, control_params(set_line, line_coding.clone()))
            .unwrap();
        let completion = out.submit_sync(None).unwrap();
        assert!(completion.is_success());
        assert_eq!(completion.actual_length, 7);
        assert_eq!(transport.control_out(), vec![(set_line, line_coding)]);

        // GET_LINE_CODING
        transport.push_control_in(vec![0x80, 0x25, 0x00, 0x00, 0x00, 0x00, 0x08]);
        let input = session.alloc_request(&handle, 0, 64).unwrap();
        session
            .fill_request(
                &input,
                &handle,
                control_params(setup(PipeDirection::In, 0x21, 7), Vec::new()),
            )
            .unwrap();
        let completion = input.submit_sync(None).unwrap();
        assert_eq!(completion.data, vec![0x80, 0x25, 0x00, 0x00, 0x00, 0x00, 0x08]);

        out.free().unwrap();
        input.free().unwrap();
        session.close_interface(handle).unwrap();
        session.release_interface(&claimed).unwrap();
        assert_eq!(session.pool_count(), 0);
    }

    #[test]
    fn test_control_payload_must_match_length() {
        let fx = Fixture::new();
        let claimed = fx.session.claim_interface(ADDRESS, CONTROL_INTERFACE).unwrap();
        let handle = fx.session.open_interface(&claimed).unwrap();
        let request = fx.session.alloc_request(&handle, 0, 64).unwrap();

        let short = control_params(setup(PipeDirection::Out, 0x20, 7), vec![0; 3]);
        assert!(matches!(
            fx.session.fill_request(&request, &handle, short),
            Err(Error::InvalidParameter(_))
        ));

        let data_on_control = RequestParams {
            interface_number: CONTROL_INTERFACE,
            pipe_id: CONTROL_PIPE_ID,
            timeout: Duration::from_secs(1),
            data: RequestData::Data {
                payload: vec![0; 4],
                length: 0,
            },
        };
        assert!(matches!(
            fx.session.fill_request(&request, &handle, data_on_control),
            Err(Error::InvalidParameter(_))
        ));

        request.free().unwrap();
        fx.session.close_interface(handle).unwrap();
        fx.session.release_interface(&claimed).unwrap();
        fx.teardown();
    }
}
