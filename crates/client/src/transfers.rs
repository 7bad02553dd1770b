//! Control transfer execution
//!
//! Synchronous transfers block in the platform until they complete or time
//! out. Asynchronous transfers are started with a completion channel, given a
//! bounded wait window while the platform dispatcher runs, aborted if still
//! pending, and then awaited until the abort forces their completion.
//!
//! Transfer failures are reported as data through [`TransferResult`], never
//! as `Err`, so callers can react to stalls directly.

use crate::platform::UsbPlatform;
use common::{Completion, CompletionReceiver, Result, completion_channel};
use protocol::{ControlSetup, Direction, TransferResult};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default no-data and completion timeout for control transfers
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(6);

/// Dispatcher run length while waiting for an aborted transfer to complete
const DISPATCH_TICK: Duration = Duration::from_millis(10);

/// Execute a synchronous control transfer
///
/// With no `data` buffer, a zero-filled buffer of `setup.length` bytes owned
/// by this call is sent instead.
pub fn control_transfer<P: UsbPlatform>(
    platform: &P,
    device: &mut P::Device,
    setup: ControlSetup,
    data: Option<&mut [u8]>,
    timeout: Duration,
) -> TransferResult {
    let length = setup.length as usize;

    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
        setup.request_type, setup.request, setup.value, setup.index, length
    );

    let outcome = match data {
        Some(buffer) => {
            if buffer.len() < length {
                warn!(
                    "Control transfer buffer too small: {} < {}",
                    buffer.len(),
                    length
                );
                return TransferResult::DISPATCH_FAILED;
            }
            platform.control_transfer(device, &setup, &mut buffer[..length], timeout)
        }
        None => {
            let mut zeroes = vec![0u8; length];
            platform.control_transfer(device, &setup, &mut zeroes, timeout)
        }
    };

    let result = TransferResult::from_status(outcome.status, outcome.length);
    if result.is_ok() {
        debug!("Control transfer succeeded: {} bytes", result.length);
    } else {
        warn!(
            "Control transfer finished with {:?} ({})",
            result.state, outcome.status
        );
    }
    result
}

/// Execute a control transfer with a bounded wait
///
/// Waits up to `wait` for the transfer to complete while running the
/// dispatcher. If it is still pending after that, the default pipe is
/// aborted and the dispatcher keeps running until the aborted transfer
/// reports back. For IN requests the received bytes are copied into `data`.
///
/// If the abort or the dispatcher fails, the transfer is left in flight and
/// [`TransferResult::DISPATCH_FAILED`] is returned. Further async transfers
/// on the same device are then rejected as busy until it is closed.
pub fn control_transfer_async<P: UsbPlatform>(
    platform: &P,
    device: &mut P::Device,
    event_source: &P::EventSource,
    setup: ControlSetup,
    data: Option<&mut [u8]>,
    control_timeout: Duration,
    wait: Duration,
) -> TransferResult {
    let length = setup.length as usize;

    let buffer = match data.as_deref() {
        Some(buffer) if buffer.len() < length => {
            warn!(
                "Async control transfer buffer too small: {} < {}",
                buffer.len(),
                length
            );
            return TransferResult::DISPATCH_FAILED;
        }
        Some(buffer) => buffer[..length].to_vec(),
        None => vec![0u8; length],
    };

    let (completion_tx, completion_rx) = completion_channel();
    if let Err(e) = platform.submit_control(device, &setup, buffer, control_timeout, completion_tx) {
        warn!("Failed to submit async control transfer: {}", e);
        return TransferResult::DISPATCH_FAILED;
    }

    let completion = match await_completion(platform, device, event_source, &completion_rx, wait) {
        Ok(completion) => completion,
        Err(e) => {
            warn!(
                "Async control transfer abandoned while still in flight, \
                 device stays busy until closed: {}",
                e
            );
            return TransferResult::DISPATCH_FAILED;
        }
    };

    if setup.direction() == Direction::In
        && let Some(buffer) = data
    {
        let received = (completion.length as usize)
            .min(completion.data.len())
            .min(buffer.len());
        buffer[..received].copy_from_slice(&completion.data[..received]);
    }

    let result = TransferResult::from_status(completion.status, completion.length);
    debug!(
        "Async control transfer finished: {:?}, {} bytes ({})",
        result.state, result.length, completion.status
    );
    result
}

fn await_completion<P: UsbPlatform>(
    platform: &P,
    device: &mut P::Device,
    event_source: &P::EventSource,
    completion_rx: &CompletionReceiver,
    wait: Duration,
) -> Result<Completion> {
    let window_end = Instant::now() + wait;

    loop {
        if let Some(completion) = completion_rx.try_take()? {
            debug!("Async control transfer completed within its wait window");
            return Ok(completion);
        }

        let now = Instant::now();
        if now >= window_end {
            break;
        }
        platform.dispatch_events(event_source, window_end - now)?;
    }

    debug!("Wait window elapsed, aborting default control pipe");
    platform.abort_control_pipe(device)?;

    loop {
        if let Some(completion) = completion_rx.try_take()? {
            return Ok(completion);
        }
        platform.dispatch_events(event_source, DISPATCH_TICK)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claimer::{close_device, open_device};
    use crate::test_utils::{AsyncBehavior, Call, MockDevice, MockPlatform};
    use protocol::{Status, TransferState};

    fn opened(platform: &MockPlatform) -> crate::claimer::OpenDevice<MockPlatform> {
        let candidate = platform.find_devices(0x1234, 0x5678).unwrap().remove(0);
        open_device(platform, candidate).unwrap()
    }

    #[test]
    fn test_sync_out_sends_caller_data() {
        let platform = MockPlatform::new().with_devices(vec![MockDevice::new(1)]);
        let mut device = opened(&platform);

        let mut payload = [1u8, 2, 3, 4, 5, 6];
        let setup = ControlSetup::new(0x40, 0x01, 0, 0, 4);
        let result = control_transfer(
            &platform,
            &mut device.handle,
            setup,
            Some(&mut payload),
            DEFAULT_CONTROL_TIMEOUT,
        );

        assert_eq!(result.state, TransferState::Ok);
        assert_eq!(result.length, 4);
        assert_eq!(platform.last_control_data(), Some(vec![1, 2, 3, 4]));
        close_device(&platform, device);
    }

    #[test]
    fn test_sync_short_buffer_is_not_dispatched() {
        let platform = MockPlatform::new().with_devices(vec![MockDevice::new(1)]);
        let mut device = opened(&platform);

        let mut payload = [0u8; 2];
        let setup = ControlSetup::new(0x40, 0x01, 0, 0, 4);
        let result = control_transfer(
            &platform,
            &mut device.handle,
            setup,
            Some(&mut payload),
            DEFAULT_CONTROL_TIMEOUT,
        );

        assert!(result.is_dispatch_failure());
        assert_eq!(platform.last_control_data(), None);
        close_device(&platform, device);
    }

    #[test]
    fn test_sync_stall_is_data() {
        let platform = MockPlatform::new()
            .with_devices(vec![MockDevice::new(1)])
            .with_control_response(Status::Stalled, Vec::new());
        let mut device = opened(&platform);

        let setup = ControlSetup::new(0xc0, 0x10, 0, 0, 0);
        let result = control_transfer(&platform, &mut device.handle, setup, None, DEFAULT_CONTROL_TIMEOUT);

        assert_eq!(result.state, TransferState::Stall);
        assert_eq!(result.length, 0);
        close_device(&platform, device);
    }

    #[test]
    fn test_async_early_completion_skips_abort() {
        let platform = MockPlatform::new()
            .with_devices(vec![MockDevice::new(1)])
            .with_control_response(Status::Success, vec![9, 8, 7])
            .with_async(AsyncBehavior::CompleteOnSubmit);
        let mut device = opened(&platform);

        let mut buffer = [0u8; 3];
        let setup = ControlSetup::new(0xc0, 0x20, 0, 0, 3);
        let started = Instant::now();
        let result = control_transfer_async(
            &platform,
            &mut device.handle,
            &device.event_source,
            setup,
            Some(&mut buffer),
            DEFAULT_CONTROL_TIMEOUT,
            Duration::from_secs(5),
        );

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.state, TransferState::Ok);
        assert_eq!(result.length, 3);
        assert_eq!(buffer, [9, 8, 7]);
        assert!(!platform.calls().contains(&Call::AbortControlPipe(1)));
        close_device(&platform, device);
    }

    #[test]
    fn test_async_submit_failure_returns_sentinel() {
        let platform = MockPlatform::new()
            .with_devices(vec![MockDevice::new(1)])
            .with_async(AsyncBehavior::FailSubmit(Status::NoDevice));
        let mut device = opened(&platform);

        let setup = ControlSetup::new(0x40, 0x01, 0, 0, 0);
        let result = control_transfer_async(
            &platform,
            &mut device.handle,
            &device.event_source,
            setup,
            None,
            DEFAULT_CONTROL_TIMEOUT,
            Duration::from_millis(10),
        );

        assert!(result.is_dispatch_failure());
        assert!(!platform.calls().contains(&Call::AbortControlPipe(1)));
        close_device(&platform, device);
    }

    #[test]
    fn test_async_abort_failure_skips_dispatch_wait() {
        let platform = MockPlatform::new()
            .with_devices(vec![MockDevice::new(1)])
            .with_async(AsyncBehavior::FailAbort(Status::Io));
        let mut device = opened(&platform);

        let setup = ControlSetup::new(0x40, 0x01, 0, 0, 0);
        let result = control_transfer_async(
            &platform,
            &mut device.handle,
            &device.event_source,
            setup,
            None,
            DEFAULT_CONTROL_TIMEOUT,
            Duration::from_millis(10),
        );

        assert!(result.is_dispatch_failure());
        let calls = platform.calls();
        let abort = calls
            .iter()
            .position(|c| *c == Call::AbortControlPipe(1))
            .unwrap();
        assert!(!calls[abort..].contains(&Call::DispatchEvents));
        close_device(&platform, device);
    }
}
