//! Test utilities for the USB host core
//!
//! [`MockTransport`] keeps a table of fake devices in memory and records every
//! hardware call, with switches for injecting failures. [`RecordingRegistrar`]
//! stands in for the driver host.

use crate::pnp::DeviceRegistrar;
use crate::transport::{RawTransport, Transfer};
use common::{Error, Result};
use protocol::{ConfigDescriptor, DeviceAddress, DeviceDescriptor, DriverBinding};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Default)]
struct MockState {
    devices: HashMap<DeviceAddress, (DeviceDescriptor, ConfigDescriptor)>,
    open: HashSet<DeviceAddress>,
    claimed: HashSet<(DeviceAddress, u8)>,
    claim_calls: usize,
    release_calls: usize,
    open_calls: usize,
    close_calls: usize,
    fail_next_claim: Option<Error>,
    fail_release: Option<Error>,
    fail_config: bool,
    claim_delay: Duration,
    release_delay: Duration,
    open_delay: Duration,
    alt_settings: HashMap<(DeviceAddress, u8), u8>,
    cleared_halts: Vec<u8>,
    /// Queued IN data per endpoint address
    in_data: HashMap<u8, VecDeque<Vec<u8>>>,
    /// OUT data per endpoint address, in arrival order
    written: HashMap<u8, Vec<Vec<u8>>>,
    /// Endpoints whose transfers block until cancelled or timed out
    stalled: HashSet<u8>,
    cancel_generation: HashMap<u8, u64>,
    control_in: VecDeque<Vec<u8>>,
    control_out: Vec<(protocol::ControlSetup, Vec<u8>)>,
}

/// In-memory transport
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Plug in a device
    pub fn add_device(
        &self,
        address: DeviceAddress,
        device: DeviceDescriptor,
        config: ConfigDescriptor,
    ) {
        self.lock().devices.insert(address, (device, config));
    }

    /// Unplug a device; later calls report `NoDevice`
    pub fn remove_device(&self, address: DeviceAddress) {
        let mut state = self.lock();
        state.devices.remove(&address);
        state.open.remove(&address);
    }

    pub fn fail_next_claim(&self, err: Error) {
        self.lock().fail_next_claim = Some(err);
    }

    pub fn fail_release(&self, err: Option<Error>) {
        self.lock().fail_release = err;
    }

    pub fn fail_config(&self, fail: bool) {
        self.lock().fail_config = fail;
    }

    /// Hold every hardware claim for `delay`
    pub fn set_claim_delay(&self, delay: Duration) {
        self.lock().claim_delay = delay;
    }

    pub fn set_release_delay(&self, delay: Duration) {
        self.lock().release_delay = delay;
    }

    /// Every later `open_device` sleeps this long before succeeding
    pub fn set_open_delay(&self, delay: Duration) {
        self.lock().open_delay = delay;
    }

    pub fn push_in_data(&self, endpoint: u8, data: Vec<u8>) {
        self.lock()
            .in_data
            .entry(endpoint)
            .or_default()
            .push_back(data);
    }

    pub fn push_control_in(&self, data: Vec<u8>) {
        self.lock().control_in.push_back(data);
    }

    /// Make transfers on `endpoint` hang until cancelled or timed out
    pub fn stall_endpoint(&self, endpoint: u8) {
        self.lock().stalled.insert(endpoint);
    }

    pub fn unstall_endpoint(&self, endpoint: u8) {
        self.lock().stalled.remove(&endpoint);
        self.changed.notify_all();
    }

    pub fn written(&self, endpoint: u8) -> Vec<Vec<u8>> {
        self.lock()
            .written
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn control_out(&self) -> Vec<(protocol::ControlSetup, Vec<u8>)> {
        self.lock().control_out.clone()
    }

    pub fn is_open(&self, address: DeviceAddress) -> bool {
        self.lock().open.contains(&address)
    }

    pub fn is_claimed(&self, address: DeviceAddress, interface: u8) -> bool {
        self.lock().claimed.contains(&(address, interface))
    }

    pub fn claim_calls(&self) -> usize {
        self.lock().claim_calls
    }

    pub fn release_calls(&self) -> usize {
        self.lock().release_calls
    }

    pub fn open_calls(&self) -> usize {
        self.lock().open_calls
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    pub fn alt_setting(&self, address: DeviceAddress, interface: u8) -> Option<u8> {
        self.lock().alt_settings.get(&(address, interface)).copied()
    }

    pub fn cleared_halts(&self) -> Vec<u8> {
        self.lock().cleared_halts.clone()
    }

    fn check_present(state: &MockState, address: DeviceAddress) -> Result<()> {
        if state.devices.contains_key(&address) {
            Ok(())
        } else {
            Err(Error::NoDevice)
        }
    }

    fn wait_stalled(
        &self,
        mut state: MutexGuard<'_, MockState>,
        endpoint: u8,
        timeout: Duration,
    ) -> Result<usize> {
        let generation = state.cancel_generation.get(&endpoint).copied().unwrap_or(0);
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            if state.cancel_generation.get(&endpoint).copied().unwrap_or(0) != generation {
                return Err(Error::Cancelled);
            }
            if !state.stalled.contains(&endpoint) {
                return Ok(0);
            }
            state = match deadline {
                None => self
                    .changed
                    .wait(state)
                    .unwrap_or_else(|p| p.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(timeout));
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|p| p.into_inner())
                        .0
                }
            };
        }
    }
}

impl RawTransport for MockTransport {
    fn open_device(&self, address: DeviceAddress) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            Self::check_present(&state, address)?;
            state.open_calls += 1;
            state.open_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.lock().open.insert(address);
        Ok(())
    }

    fn close_device(&self, address: DeviceAddress) -> Result<()> {
        let mut state = self.lock();
        state.close_calls += 1;
        state.open.remove(&address);
        state.claimed.retain(|(addr, _)| *addr != address);
        Ok(())
    }

    fn device_descriptor(&self, address: DeviceAddress) -> Result<DeviceDescriptor> {
        let state = self.lock();
        state
            .devices
            .get(&address)
            .map(|(device, _)| *device)
            .ok_or(Error::NoDevice)
    }

    fn config_descriptor(&self, address: DeviceAddress) -> Result<ConfigDescriptor> {
        let state = self.lock();
        if state.fail_config {
            return Err(Error::HardwareFailure("config descriptor read failed".into()));
        }
        state
            .devices
            .get(&address)
            .map(|(_, config)| config.clone())
            .ok_or(Error::NoDevice)
    }

    fn claim_interface(&self, address: DeviceAddress, interface: u8) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            Self::check_present(&state, address)?;
            state.claim_calls += 1;
            if let Some(err) = state.fail_next_claim.take() {
                return Err(err);
            }
            state.claim_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.lock().claimed.insert((address, interface));
        Ok(())
    }

    fn release_interface(&self, address: DeviceAddress, interface: u8) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.release_calls += 1;
            if let Some(err) = state.fail_release.take() {
                return Err(err);
            }
            Self::check_present(&state, address)?;
            state.release_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.lock().claimed.remove(&(address, interface));
        Ok(())
    }

    fn set_alt_setting(
        &self,
        address: DeviceAddress,
        interface: u8,
        alt_setting: u8,
    ) -> Result<()> {
        let mut state = self.lock();
        Self::check_present(&state, address)?;
        state.alt_settings.insert((address, interface), alt_setting);
        Ok(())
    }

    fn clear_halt(&self, address: DeviceAddress, endpoint: u8) -> Result<()> {
        let mut state = self.lock();
        Self::check_present(&state, address)?;
        state.cleared_halts.push(endpoint);
        Ok(())
    }

    fn transfer(&self, address: DeviceAddress, transfer: &mut Transfer) -> Result<usize> {
        let mut state = self.lock();
        Self::check_present(&state, address)?;

        if state.stalled.contains(&transfer.endpoint) {
            return self.wait_stalled(state, transfer.endpoint, transfer.timeout);
        }

        if let Some(setup) = transfer.setup {
            if transfer.is_in() {
                let data = state.control_in.pop_front().unwrap_or_default();
                let n = data.len().min(transfer.length);
                transfer.buffer[..n].copy_from_slice(&data[..n]);
                return Ok(n);
            }
            let payload = transfer.buffer[..transfer.length].to_vec();
            state.control_out.push((setup, payload));
            return Ok(transfer.length);
        }

        if transfer.is_in() {
            let data = state
                .in_data
                .get_mut(&transfer.endpoint)
                .and_then(|queue| queue.pop_front())
                .ok_or_else(|| Error::Timeout(transfer.timeout))?;
            let n = data.len().min(transfer.length);
            transfer.buffer[..n].copy_from_slice(&data[..n]);
            Ok(n)
        } else {
            let payload = transfer.buffer[..transfer.length].to_vec();
            state
                .written
                .entry(transfer.endpoint)
                .or_default()
                .push(payload);
            Ok(transfer.length)
        }
    }

    fn cancel_transfer(&self, _address: DeviceAddress, endpoint: u8) -> Result<()> {
        let mut state = self.lock();
        *state.cancel_generation.entry(endpoint).or_insert(0) += 1;
        self.changed.notify_all();
        Ok(())
    }
}

/// Registrar that records every call and can be told to refuse bindings
#[derive(Default)]
pub struct RecordingRegistrar {
    registered: Mutex<Vec<DriverBinding>>,
    unregistered: Mutex<Vec<DriverBinding>>,
    /// Module names whose registration fails
    refuse: Mutex<HashSet<String>>,
}

impl RecordingRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_module(&self, module: &str) {
        self.refuse
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(module.to_string());
    }

    pub fn registered(&self) -> Vec<DriverBinding> {
        self.registered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn unregistered(&self) -> Vec<DriverBinding> {
        self.unregistered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl DeviceRegistrar for RecordingRegistrar {
    fn register(&self, binding: &DriverBinding) -> Result<()> {
        if self
            .refuse
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&binding.module_name)
        {
            return Err(Error::HardwareFailure(format!(
                "driver host refused {}",
                binding.module_name
            )));
        }
        self.registered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(binding.clone());
        Ok(())
    }

    fn unregister(&self, binding: &DriverBinding) -> Result<()> {
        self.unregistered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(binding.clone());
        Ok(())
    }
}
