//! Test utilities for usb-ctrl
//!
//! [`MockPlatform`] is an in-memory [`UsbPlatform`] with scripted device
//! scans, per-step failure injection, and a log of every platform call, so
//! the claiming unwind order and the async abort protocol can be checked
//! without hardware.
//!
//! # Example
//!
//! ```
//! use client::test_utils::{ClaimStep, MockDevice, MockPlatform};
//!
//! let platform = MockPlatform::new().with_devices(vec![
//!     MockDevice::new(1).failing_at(ClaimStep::Seize),
//!     MockDevice::new(2),
//! ]);
//! assert_eq!(platform.outstanding_devices(), 0);
//! ```

use crate::matcher::CancelToken;
use crate::platform::{TransferOutcome, UsbPlatform};
use common::{Completion, CompletionSender, Error, Result};
use protocol::{ControlSetup, Direction, Status};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Claiming step at which a [`MockDevice`] fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimStep {
    Seize,
    ReadConfiguration,
    SetConfiguration,
    CreateEventSource,
    ListInterfaces,
    SeizeInterface,
    SetAlternateSetting,
}

impl ClaimStep {
    pub const ALL: [ClaimStep; 7] = [
        ClaimStep::Seize,
        ClaimStep::ReadConfiguration,
        ClaimStep::SetConfiguration,
        ClaimStep::CreateEventSource,
        ClaimStep::ListInterfaces,
        ClaimStep::SeizeInterface,
        ClaimStep::SetAlternateSetting,
    ];

    /// Status reported when this step fails
    pub fn status(self) -> Status {
        match self {
            ClaimStep::Seize | ClaimStep::SeizeInterface => Status::Busy,
            ClaimStep::ReadConfiguration | ClaimStep::ListInterfaces => Status::Io,
            ClaimStep::SetConfiguration => Status::Access,
            ClaimStep::CreateEventSource => Status::Other(-99),
            ClaimStep::SetAlternateSetting => Status::NotSupported,
        }
    }
}

/// What the mock does with asynchronous control transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncBehavior {
    /// Complete with the configured control response as soon as submitted
    CompleteOnSubmit,
    /// Complete with the configured control response once `delay` has passed
    CompleteAfter(Duration),
    /// Stay pending until aborted, then complete as aborted with `length`
    CompleteOnAbort { length: u32 },
    /// Reject the submission
    FailSubmit(Status),
    /// Never complete and reject the abort
    FailAbort(Status),
}

impl Default for AsyncBehavior {
    fn default() -> Self {
        AsyncBehavior::CompleteOnAbort { length: 0 }
    }
}

/// Platform call recorded by [`MockPlatform`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SeizeDevice(u32),
    SetConfiguration(u32, u8),
    CreateEventSource(u32),
    RegisterEventSource(u32),
    DeregisterEventSource(u32),
    CloseDevice(u32),
    ReleaseDevice(u32),
    SeizeInterface(u32, u8),
    SetAlternateSetting(u32, u8, u8),
    CloseInterface(u32, u8),
    ReleaseInterface(u32, u8),
    ControlTransfer(u32),
    SubmitControl(u32),
    AbortControlPipe(u32),
    DispatchEvents,
    ResetDevice(u32),
    ReenumerateDevice(u32),
}

/// Scripted device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    pub id: u32,
    pub interfaces: u8,
    pub configuration: u8,
    pub fail_at: Option<ClaimStep>,
}

impl MockDevice {
    /// Claimable device with one interface
    pub fn new(id: u32) -> Self {
        Self {
            id,
            interfaces: 1,
            configuration: 1,
            fail_at: None,
        }
    }

    pub fn failing_at(mut self, step: ClaimStep) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn with_interfaces(mut self, count: u8) -> Self {
        self.interfaces = count;
        self
    }

    fn check(&self, step: ClaimStep) -> Result<()> {
        if self.fail_at == Some(step) {
            return Err(Error::platform("mock", step.status()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockCandidate {
    device: MockDevice,
}

impl MockCandidate {
    pub fn id(&self) -> u32 {
        self.device.id
    }
}

#[derive(Debug)]
pub struct MockHandle {
    device: MockDevice,
}

impl MockHandle {
    pub fn id(&self) -> u32 {
        self.device.id
    }
}

#[derive(Debug)]
pub struct MockInterfaceRef {
    index: u8,
}

#[derive(Debug)]
pub struct MockInterface {
    index: u8,
}

#[derive(Debug)]
pub struct MockEventSource {
    device_id: u32,
}

struct PendingTransfer {
    sender: CompletionSender,
    direction: Direction,
    data: Vec<u8>,
    due: Option<Instant>,
    aborted: bool,
}

struct State {
    scans: Vec<Vec<MockDevice>>,
    scan_count: usize,
    failing_queries: usize,
    cancel_after: Option<(usize, CancelToken)>,
    open_devices: HashSet<u32>,
    open_interfaces: usize,
    calls: Vec<Call>,
    control_status: Status,
    control_response: Vec<u8>,
    last_control_data: Option<Vec<u8>>,
    async_behavior: AsyncBehavior,
    pending: HashMap<u32, PendingTransfer>,
    reset_failure: Option<Status>,
    reenumerate_failure: Option<Status>,
}

impl State {
    /// Apply the configured control response to a data stage
    fn respond(&self, direction: Direction, data: &mut [u8]) -> TransferOutcome {
        if !self.control_status.is_success() {
            return TransferOutcome::new(self.control_status, 0);
        }

        let length = match direction {
            Direction::In => {
                let n = self.control_response.len().min(data.len());
                data[..n].copy_from_slice(&self.control_response[..n]);
                n
            }
            Direction::Out => data.len(),
        };
        TransferOutcome::new(self.control_status, length as u32)
    }

    fn finish(&self, mut pending: PendingTransfer) {
        let completion = if pending.aborted {
            let length = match self.async_behavior {
                AsyncBehavior::CompleteOnAbort { length } => length,
                _ => 0,
            };
            Completion {
                status: Status::Aborted,
                length,
                data: pending.data,
            }
        } else {
            let outcome = self.respond(pending.direction, &mut pending.data);
            Completion {
                status: outcome.status,
                length: outcome.length,
                data: pending.data,
            }
        };
        let _ = pending.sender.complete(completion);
    }
}

/// In-memory USB platform
///
/// Clones share state, so a test can keep one clone for assertions while a
/// session owns another.
#[derive(Clone)]
pub struct MockPlatform {
    state: Arc<Mutex<State>>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// Platform with no devices present
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                scans: Vec::new(),
                scan_count: 0,
                failing_queries: 0,
                cancel_after: None,
                open_devices: HashSet::new(),
                open_interfaces: 0,
                calls: Vec::new(),
                control_status: Status::Success,
                control_response: Vec::new(),
                last_control_data: None,
                async_behavior: AsyncBehavior::default(),
                pending: HashMap::new(),
                reset_failure: None,
                reenumerate_failure: None,
            })),
        }
    }

    /// The same devices are present on every scan
    pub fn with_devices(self, devices: Vec<MockDevice>) -> Self {
        self.state().scans = vec![devices];
        self
    }

    /// Scan `n` sees `scans[n]`; the last entry repeats afterwards
    pub fn with_scans(self, scans: Vec<Vec<MockDevice>>) -> Self {
        self.state().scans = scans;
        self
    }

    /// The first `count` registry queries fail
    pub fn failing_registry_queries(self, count: usize) -> Self {
        self.state().failing_queries = count;
        self
    }

    /// Cancel `token` once `scans` registry queries have been made
    pub fn cancel_after_scans(self, scans: usize, token: CancelToken) -> Self {
        self.state().cancel_after = Some((scans, token));
        self
    }

    /// Status and IN data returned by every control transfer
    pub fn with_control_response(self, status: Status, data: Vec<u8>) -> Self {
        {
            let mut state = self.state();
            state.control_status = status;
            state.control_response = data;
        }
        self
    }

    pub fn with_async(self, behavior: AsyncBehavior) -> Self {
        self.state().async_behavior = behavior;
        self
    }

    pub fn fail_reset(self, status: Status) -> Self {
        self.state().reset_failure = Some(status);
        self
    }

    pub fn fail_reenumerate(self, status: Status) -> Self {
        self.state().reenumerate_failure = Some(status);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Devices seized and not yet released
    pub fn outstanding_devices(&self) -> usize {
        self.state().open_devices.len()
    }

    /// Interfaces seized and not yet released
    pub fn outstanding_interfaces(&self) -> usize {
        self.state().open_interfaces
    }

    /// Registry queries made so far
    pub fn scan_count(&self) -> usize {
        self.state().scan_count
    }

    /// Data stage of the most recent sync or async control transfer
    pub fn last_control_data(&self) -> Option<Vec<u8>> {
        self.state().last_control_data.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

impl UsbPlatform for MockPlatform {
    type Candidate = MockCandidate;
    type Device = MockHandle;
    type InterfaceRef = MockInterfaceRef;
    type Interface = MockInterface;
    type EventSource = MockEventSource;

    fn find_devices(&self, _vendor_id: u16, _product_id: u16) -> Result<Vec<MockCandidate>> {
        let mut state = self.state();
        let scan = state.scan_count;
        state.scan_count += 1;

        if let Some((after, token)) = &state.cancel_after
            && state.scan_count >= *after
        {
            token.cancel();
        }

        if scan < state.failing_queries {
            return Err(Error::platform("find devices", Status::Io));
        }

        let devices = match state.scans.len() {
            0 => Vec::new(),
            len => state.scans[scan.min(len - 1)].clone(),
        };
        Ok(devices
            .into_iter()
            .map(|device| MockCandidate { device })
            .collect())
    }

    fn seize_device(&self, candidate: MockCandidate) -> Result<MockHandle> {
        let device = candidate.device;
        let mut state = self.state();
        state.calls.push(Call::SeizeDevice(device.id));

        device.check(ClaimStep::Seize)?;
        if !state.open_devices.insert(device.id) {
            return Err(Error::platform("seize device", Status::Busy));
        }
        Ok(MockHandle { device })
    }

    fn default_configuration(&self, device: &MockHandle) -> Result<u8> {
        device.device.check(ClaimStep::ReadConfiguration)?;
        Ok(device.device.configuration)
    }

    fn set_configuration(&self, device: &mut MockHandle, value: u8) -> Result<()> {
        self.record(Call::SetConfiguration(device.id(), value));
        device.device.check(ClaimStep::SetConfiguration)
    }

    fn create_event_source(&self, device: &mut MockHandle) -> Result<MockEventSource> {
        self.record(Call::CreateEventSource(device.id()));
        device.device.check(ClaimStep::CreateEventSource)?;
        Ok(MockEventSource {
            device_id: device.id(),
        })
    }

    fn register_event_source(&self, source: &MockEventSource) {
        self.record(Call::RegisterEventSource(source.device_id));
    }

    fn deregister_event_source(&self, source: MockEventSource) {
        self.record(Call::DeregisterEventSource(source.device_id));
    }

    fn close_device(&self, device: &mut MockHandle) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::CloseDevice(device.id()));
        // Closing drops whatever was still in flight
        state.pending.remove(&device.id());
        Ok(())
    }

    fn release_device(&self, device: MockHandle) {
        let mut state = self.state();
        state.calls.push(Call::ReleaseDevice(device.id()));
        state.open_devices.remove(&device.id());
    }

    fn interfaces(&self, device: &MockHandle) -> Result<Vec<MockInterfaceRef>> {
        device.device.check(ClaimStep::ListInterfaces)?;
        Ok((0..device.device.interfaces)
            .map(|index| MockInterfaceRef { index })
            .collect())
    }

    fn seize_interface(
        &self,
        device: &mut MockHandle,
        interface: MockInterfaceRef,
    ) -> Result<MockInterface> {
        let mut state = self.state();
        state
            .calls
            .push(Call::SeizeInterface(device.id(), interface.index));

        device.device.check(ClaimStep::SeizeInterface)?;
        state.open_interfaces += 1;
        Ok(MockInterface {
            index: interface.index,
        })
    }

    fn set_alternate_setting(
        &self,
        device: &mut MockHandle,
        interface: &mut MockInterface,
        alt_setting: u8,
    ) -> Result<()> {
        self.record(Call::SetAlternateSetting(
            device.id(),
            interface.index,
            alt_setting,
        ));
        device.device.check(ClaimStep::SetAlternateSetting)
    }

    fn close_interface(&self, device: &mut MockHandle, interface: &mut MockInterface) -> Result<()> {
        self.record(Call::CloseInterface(device.id(), interface.index));
        Ok(())
    }

    fn release_interface(&self, device: &mut MockHandle, interface: MockInterface) {
        let mut state = self.state();
        state
            .calls
            .push(Call::ReleaseInterface(device.id(), interface.index));
        state.open_interfaces = state.open_interfaces.saturating_sub(1);
    }

    fn control_transfer(
        &self,
        device: &mut MockHandle,
        setup: &ControlSetup,
        data: &mut [u8],
        _timeout: Duration,
    ) -> TransferOutcome {
        let mut state = self.state();
        state.calls.push(Call::ControlTransfer(device.id()));
        state.last_control_data = Some(data.to_vec());
        state.respond(setup.direction(), data)
    }

    fn submit_control(
        &self,
        device: &mut MockHandle,
        setup: &ControlSetup,
        data: Vec<u8>,
        _timeout: Duration,
        completion: CompletionSender,
    ) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::SubmitControl(device.id()));

        // One transfer per default pipe, like the libusb backend
        if state.pending.contains_key(&device.id()) {
            return Err(Error::platform("submit control transfer", Status::Busy));
        }

        let due = match state.async_behavior {
            AsyncBehavior::FailSubmit(status) => {
                return Err(Error::platform("submit control transfer", status));
            }
            AsyncBehavior::CompleteOnSubmit => Some(Instant::now()),
            AsyncBehavior::CompleteAfter(delay) => Some(Instant::now() + delay),
            AsyncBehavior::CompleteOnAbort { .. } | AsyncBehavior::FailAbort(_) => None,
        };

        state.last_control_data = Some(data.clone());
        let pending = PendingTransfer {
            sender: completion,
            direction: setup.direction(),
            data,
            due,
            aborted: false,
        };

        if state.async_behavior == AsyncBehavior::CompleteOnSubmit {
            state.finish(pending);
        } else {
            state.pending.insert(device.id(), pending);
        }
        Ok(())
    }

    fn abort_control_pipe(&self, device: &mut MockHandle) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::AbortControlPipe(device.id()));

        if let AsyncBehavior::FailAbort(status) = state.async_behavior {
            return Err(Error::platform("abort control pipe", status));
        }
        if let Some(pending) = state.pending.get_mut(&device.id()) {
            pending.aborted = true;
        }
        Ok(())
    }

    fn dispatch_events(&self, source: &MockEventSource, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let sleep = {
            let mut state = self.state();
            state.calls.push(Call::DispatchEvents);

            match state.pending.get(&source.device_id) {
                Some(pending) if pending.aborted => Duration::ZERO,
                Some(PendingTransfer { due: Some(due), .. }) => {
                    due.saturating_duration_since(started).min(timeout)
                }
                _ => timeout,
            }
        };

        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }

        let mut state = self.state();
        let ready = state.pending.get(&source.device_id).is_some_and(|pending| {
            pending.aborted || pending.due.is_some_and(|due| Instant::now() >= due)
        });
        if ready && let Some(pending) = state.pending.remove(&source.device_id) {
            state.finish(pending);
        }
        Ok(())
    }

    fn reset_device(&self, device: &mut MockHandle) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::ResetDevice(device.id()));
        match state.reset_failure {
            Some(status) => Err(Error::platform("reset device", status)),
            None => Ok(()),
        }
    }

    fn reenumerate_device(&self, device: &mut MockHandle) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::ReenumerateDevice(device.id()));
        match state.reenumerate_failure {
            Some(status) => Err(Error::platform("re-enumerate device", status)),
            None => Ok(()),
        }
    }
}
