//! Request queues and IO worker threads
//!
//! Every opened device pool runs two dedicated threads joined by bounded
//! async-channel queues: the submit worker pulls requests and runs them
//! through the [`RawTransport`], the completion worker records the outcome,
//! wakes synchronous waiters and invokes callbacks. Callbacks therefore never
//! run on the submitting thread.

use crate::pool::InterfacePool;
use crate::transport::{RawTransport, Transfer};
use async_channel::{Receiver, Sender, bounded};
use common::{Error, IoMetrics, Result};
use protocol::{ControlSetup, DeviceAddress, PipeDirection, PipeType};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Callback run on the completion worker
pub type CompletionCallback = Box<dyn FnOnce(&Completion) + Send + 'static>;

/// Lifecycle of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Allocated, not yet filled
    Idle,
    /// Filled and ready to submit
    Filled,
    /// Queued for the submit worker
    Pending,
    /// Running in the transport
    InFlight,
    /// Finished; may be resubmitted
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Cancelled,
    TimedOut,
    NoDevice,
    Failed(String),
}

/// Outcome of one submitted request
#[derive(Debug, Clone)]
pub struct Completion {
    pub request_id: u32,
    pub status: CompletionStatus,
    pub actual_length: usize,
    /// Received bytes for IN transfers, empty otherwise
    pub data: Vec<u8>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

/// Payload of a fill call
#[derive(Debug, Clone)]
pub enum RequestData {
    /// Control transfer on the control pipe; `payload` is the OUT data stage
    Control {
        setup: ControlSetup,
        payload: Vec<u8>,
    },
    /// Bulk, interrupt or isochronous transfer. OUT pipes send `payload`,
    /// IN pipes read up to `length` bytes.
    Data { payload: Vec<u8>, length: usize },
}

/// Parameters of a fill call
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub interface_number: u8,
    pub pipe_id: u8,
    /// `Duration::ZERO` waits forever
    pub timeout: Duration,
    pub data: RequestData,
}

struct RequestSlot {
    state: RequestState,
    transfer: Option<Transfer>,
    /// Endpoint of the transfer while it is in flight
    endpoint: Option<u8>,
    cancel_requested: bool,
    submitted_at: Option<Instant>,
    completion: Option<Completion>,
    callback: Option<CompletionCallback>,
    notify: Option<tokio::sync::oneshot::Sender<Completion>>,
}

pub(crate) struct RequestInner {
    id: u32,
    capacity: usize,
    iso_packets: usize,
    pool: Arc<InterfacePool>,
    slot: Mutex<RequestSlot>,
    done: Condvar,
}

impl RequestInner {
    /// Hand the transfer to the submit worker; `None` if cancelled while queued
    fn begin(&self) -> Option<Transfer> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if slot.cancel_requested {
            return None;
        }
        slot.state = RequestState::InFlight;
        let transfer = slot.transfer.take();
        slot.endpoint = transfer.as_ref().map(|t| t.endpoint);
        transfer
    }

    fn finish(&self, transfer: Option<Transfer>, result: Result<usize>, metrics: &IoMetrics) {
        let (completion, callback, notify) = {
            let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
            let elapsed = slot
                .submitted_at
                .map(|t| t.elapsed())
                .unwrap_or_default();

            let (status, actual_length) = match result {
                Ok(n) => {
                    metrics.record_success(n as u64, elapsed);
                    (CompletionStatus::Success, n)
                }
                Err(_) if slot.cancel_requested => {
                    metrics.record_cancel();
                    (CompletionStatus::Cancelled, 0)
                }
                Err(Error::Cancelled) => {
                    metrics.record_cancel();
                    (CompletionStatus::Cancelled, 0)
                }
                Err(Error::Timeout(_)) => {
                    metrics.record_failure();
                    (CompletionStatus::TimedOut, 0)
                }
                Err(Error::NoDevice) => {
                    metrics.record_failure();
                    (CompletionStatus::NoDevice, 0)
                }
                Err(e) => {
                    metrics.record_failure();
                    (CompletionStatus::Failed(e.to_string()), 0)
                }
            };

            let data = match &transfer {
                Some(t) if t.is_in() && actual_length > 0 => {
                    t.buffer[..actual_length.min(t.buffer.len())].to_vec()
                }
                _ => Vec::new(),
            };
            if let Some(t) = transfer {
                slot.transfer = Some(t);
            }

            let completion = Completion {
                request_id: self.id,
                status,
                actual_length,
                data,
            };
            slot.state = RequestState::Completed;
            slot.endpoint = None;
            slot.cancel_requested = false;
            slot.completion = Some(completion.clone());
            self.done.notify_all();
            (completion, slot.callback.take(), slot.notify.take())
        };

        debug!(
            "Request {} completed: {:?}, {} bytes",
            self.id, completion.status, completion.actual_length
        );
        if let Some(callback) = callback {
            // A panicking driver callback must not take the completion worker down
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&completion)
            }));
            if let Err(e) = result {
                error!("Panic in completion callback of request {}: {:?}", self.id, e);
            }
        }
        if let Some(notify) = notify {
            let _ = notify.send(completion);
        }
    }
}

/// A USB request bound to an opened interface
///
/// Cheap to clone; clones refer to the same request.
#[derive(Clone)]
pub struct UsbRequest {
    inner: Arc<RequestInner>,
}

impl std::fmt::Debug for UsbRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbRequest")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("state", &self.state())
            .finish()
    }
}

impl UsbRequest {
    pub(crate) fn new(id: u32, pool: Arc<InterfacePool>, iso_packets: usize, length: usize) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id,
                capacity: length,
                iso_packets,
                pool,
                slot: Mutex::new(RequestSlot {
                    state: RequestState::Idle,
                    transfer: None,
                    endpoint: None,
                    cancel_requested: false,
                    submitted_at: None,
                    completion: None,
                    callback: None,
                    notify: None,
                }),
                done: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Buffer size given at allocation
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn iso_packets(&self) -> usize {
        self.inner.iso_packets
    }

    pub fn state(&self) -> RequestState {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .state
    }

    /// Outcome of the most recent submission
    pub fn last_completion(&self) -> Option<Completion> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .completion
            .clone()
    }

    /// Build the transfer for `pipe_type` from `params`
    pub(crate) fn fill(
        &self,
        pipe_type: PipeType,
        direction: PipeDirection,
        endpoint: u8,
        params: RequestParams,
    ) -> Result<()> {
        let transfer = match (pipe_type, params.data) {
            (PipeType::Control, RequestData::Control { setup, payload }) => {
                let length = usize::from(setup.length);
                if length > self.inner.capacity {
                    return Err(Error::InvalidParameter(format!(
                        "control data stage of {} bytes exceeds request buffer of {}",
                        length, self.inner.capacity
                    )));
                }
                let mut buffer = vec![0u8; self.inner.capacity];
                if setup.direction == PipeDirection::Out {
                    if payload.len() != length {
                        return Err(Error::InvalidParameter(format!(
                            "control OUT payload is {} bytes, wLength is {}",
                            payload.len(),
                            length
                        )));
                    }
                    buffer[..length].copy_from_slice(&payload);
                }
                Transfer {
                    endpoint: setup.direction.bit() << 7,
                    pipe_type,
                    setup: Some(setup),
                    buffer,
                    length,
                    timeout: params.timeout,
                }
            }
            (PipeType::Control, RequestData::Data { .. }) => {
                return Err(Error::InvalidParameter(
                    "control pipe requires control parameters".to_string(),
                ));
            }
            (_, RequestData::Control { .. }) => {
                return Err(Error::InvalidParameter(format!(
                    "{:?} pipe requires data parameters",
                    pipe_type
                )));
            }
            (_, RequestData::Data { payload, length }) => {
                let length = match direction {
                    PipeDirection::Out => payload.len(),
                    PipeDirection::In => length,
                };
                if length > self.inner.capacity {
                    return Err(Error::InvalidParameter(format!(
                        "transfer of {} bytes exceeds request buffer of {}",
                        length, self.inner.capacity
                    )));
                }
                let mut buffer = vec![0u8; self.inner.capacity];
                if direction == PipeDirection::Out {
                    buffer[..length].copy_from_slice(&payload);
                }
                Transfer {
                    endpoint,
                    pipe_type,
                    setup: None,
                    buffer,
                    length,
                    timeout: params.timeout,
                }
            }
        };

        let mut slot = self.inner.slot.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(slot.state, RequestState::Pending | RequestState::InFlight) {
            return Err(Error::InvariantViolation(format!(
                "request {} refilled while submitted",
                self.inner.id
            )));
        }
        slot.transfer = Some(transfer);
        slot.completion = None;
        slot.state = RequestState::Filled;
        Ok(())
    }

    fn enqueue(
        &self,
        callback: Option<CompletionCallback>,
        notify: Option<tokio::sync::oneshot::Sender<Completion>>,
    ) -> Result<()> {
        {
            let mut slot = self.inner.slot.lock().unwrap_or_else(|p| p.into_inner());
            match slot.state {
                RequestState::Filled | RequestState::Completed if slot.transfer.is_some() => {}
                RequestState::Pending | RequestState::InFlight => {
                    return Err(Error::InvalidParameter(format!(
                        "request {} already submitted",
                        self.inner.id
                    )));
                }
                _ => {
                    return Err(Error::InvalidParameter(format!(
                        "request {} not filled",
                        self.inner.id
                    )));
                }
            }
            slot.state = RequestState::Pending;
            slot.cancel_requested = false;
            slot.submitted_at = Some(Instant::now());
            slot.completion = None;
            slot.callback = callback;
            slot.notify = notify;
        }

        if let Err(e) = self.inner.pool.submit(self.inner.clone()) {
            let mut slot = self.inner.slot.lock().unwrap_or_else(|p| p.into_inner());
            slot.state = RequestState::Filled;
            slot.callback = None;
            slot.notify = None;
            return Err(e);
        }
        Ok(())
    }

    /// Queue the request; `callback` runs on the completion worker
    pub fn submit_async<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        self.enqueue(Some(Box::new(callback)), None)
    }

    /// Queue the request and receive the completion through a oneshot channel
    pub fn submit_async_notify(&self) -> Result<tokio::sync::oneshot::Receiver<Completion>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.enqueue(None, Some(tx))?;
        Ok(rx)
    }

    /// Queue the request and block until it completes
    ///
    /// With `Some(timeout)` the request is cancelled and [`Error::Timeout`]
    /// returned when it has not completed in time; `None` waits forever.
    pub fn submit_sync(&self, timeout: Option<Duration>) -> Result<Completion> {
        self.enqueue(None, None)?;

        let slot = self.inner.slot.lock().unwrap_or_else(|p| p.into_inner());
        let still_running =
            |s: &mut RequestSlot| matches!(s.state, RequestState::Pending | RequestState::InFlight);

        let slot = match timeout {
            None => self
                .inner
                .done
                .wait_while(slot, still_running)
                .unwrap_or_else(|p| p.into_inner()),
            Some(limit) => {
                let (slot, result) = self
                    .inner
                    .done
                    .wait_timeout_while(slot, limit, still_running)
                    .unwrap_or_else(|p| p.into_inner());
                if result.timed_out() {
                    drop(slot);
                    warn!("Request {} timed out after {:?}", self.inner.id, limit);
                    if let Err(e) = self.cancel() {
                        debug!("Cancel after timeout failed: {}", e);
                    }
                    return Err(Error::Timeout(limit));
                }
                slot
            }
        };

        slot.completion
            .clone()
            .ok_or_else(|| Error::InvariantViolation("completed without outcome".to_string()))
    }

    /// Cancel a submitted request
    ///
    /// A queued request never reaches the transport; an in-flight one is
    /// aborted through the transport. The completion reports `Cancelled`.
    pub fn cancel(&self) -> Result<()> {
        let endpoint = {
            let mut slot = self.inner.slot.lock().unwrap_or_else(|p| p.into_inner());
            match slot.state {
                RequestState::Pending => {
                    slot.cancel_requested = true;
                    debug!("Request {} cancelled while queued", self.inner.id);
                    return Ok(());
                }
                RequestState::InFlight => {
                    slot.cancel_requested = true;
                    slot.endpoint.unwrap_or(0)
                }
                _ => {
                    return Err(Error::InvalidParameter(format!(
                        "request {} is not submitted",
                        self.inner.id
                    )));
                }
            }
        };

        debug!("Cancelling in-flight request {} on endpoint {:#04x}", self.inner.id, endpoint);
        self.inner.pool.cancel_transfer(endpoint)
    }

    /// Release the request; refused while it is queued or in flight
    pub fn free(self) -> Result<()> {
        let state = self.state();
        if matches!(state, RequestState::Pending | RequestState::InFlight) {
            error!("Request {} freed while {:?}", self.inner.id, state);
            return Err(Error::InvariantViolation(format!(
                "request {} is still {:?}",
                self.inner.id, state
            )));
        }
        debug!("Request {} freed", self.inner.id);
        Ok(())
    }
}

type CompletionItem = (Arc<RequestInner>, Option<Transfer>, Result<usize>);

/// Submit and completion queues of one device pool
pub(crate) struct IoQueues {
    submit_tx: Sender<Arc<RequestInner>>,
    complete_tx: Sender<CompletionItem>,
    submit_worker: Option<JoinHandle<()>>,
    complete_worker: Option<JoinHandle<()>>,
}

impl IoQueues {
    pub(crate) fn start(
        address: DeviceAddress,
        transport: Arc<dyn RawTransport>,
        depth: usize,
        metrics: Arc<IoMetrics>,
    ) -> Result<Self> {
        let (submit_tx, submit_rx) = bounded::<Arc<RequestInner>>(depth.max(1));
        let (complete_tx, complete_rx) = bounded::<CompletionItem>(depth.max(1));

        let worker_tx = complete_tx.clone();
        let submit_worker = std::thread::Builder::new()
            .name(format!("usb-io-submit-{}", address))
            .spawn(move || run_submit(address, transport, submit_rx, worker_tx))?;

        let complete_worker = std::thread::Builder::new()
            .name(format!("usb-io-complete-{}", address))
            .spawn(move || run_complete(complete_rx, metrics));
        let complete_worker = match complete_worker {
            Ok(handle) => handle,
            Err(e) => {
                submit_tx.close();
                let _ = submit_worker.join();
                return Err(e.into());
            }
        };

        debug!("IO queues started for device {}", address);
        Ok(Self {
            submit_tx,
            complete_tx,
            submit_worker: Some(submit_worker),
            complete_worker: Some(complete_worker),
        })
    }

    /// A handle on the submit queue; sends fail once the queues stop
    pub(crate) fn sender(&self) -> Sender<Arc<RequestInner>> {
        self.submit_tx.clone()
    }

    /// Drain both queues and join the workers
    pub(crate) fn stop(mut self) {
        self.submit_tx.close();
        if let Some(worker) = self.submit_worker.take() {
            if worker.join().is_err() {
                error!("USB submit worker panicked");
            }
        }
        self.complete_tx.close();
        if let Some(worker) = self.complete_worker.take() {
            if worker.join().is_err() {
                error!("USB completion worker panicked");
            }
        }
    }
}

fn run_submit(
    address: DeviceAddress,
    transport: Arc<dyn RawTransport>,
    submit_rx: Receiver<Arc<RequestInner>>,
    complete_tx: Sender<CompletionItem>,
) {
    debug!("USB submit worker for {} started", address);

    while let Ok(request) = submit_rx.recv_blocking() {
        let item = match request.begin() {
            Some(mut transfer) => {
                let result = transport.transfer(address, &mut transfer);
                (request, Some(transfer), result)
            }
            None => (request, None, Err(Error::Cancelled)),
        };

        if complete_tx.send_blocking(item).is_err() {
            warn!("Completion queue for {} closed", address);
            break;
        }
    }

    debug!("USB submit worker for {} stopped", address);
}

fn run_complete(complete_rx: Receiver<CompletionItem>, metrics: Arc<IoMetrics>) {
    while let Ok((request, transfer, result)) = complete_rx.recv_blocking() {
        request.finish(transfer, result, &metrics);
    }
}
