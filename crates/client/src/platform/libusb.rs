//! libusb backend
//!
//! Implements [`UsbPlatform`] on top of rusb. Synchronous control transfers
//! use rusb's blocking API. Asynchronous transfers go through the raw libusb
//! transfer API re-exported by rusb, with completions delivered from
//! `libusb_handle_events_timeout_completed`, which plays the role of the
//! event dispatcher.

use super::{TransferOutcome, UsbPlatform};
use common::{Completion, CompletionSender, Error, Result};
use libc::{c_int, c_uint};
use protocol::{ControlSetup, Direction, Status};
use rusb::constants::*;
use rusb::ffi::{
    libusb_alloc_transfer, libusb_cancel_transfer, libusb_free_transfer,
    libusb_handle_events_timeout_completed, libusb_submit_transfer, libusb_transfer,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::ptr::{self, NonNull};
use std::time::Duration;
use tracing::{debug, warn};

/// Dispatcher turns spent draining a transfer that is being torn down
const DRAIN_ATTEMPTS: u32 = 50;
const DRAIN_TICK: Duration = Duration::from_millis(100);

/// libusb-backed platform
pub struct LibusbPlatform {
    context: Context,
}

impl LibusbPlatform {
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(|e| Error::platform("create context", map_rusb_status(e)))?;
        Ok(Self { context })
    }
}

/// Open device
pub struct LibusbDevice {
    handle: DeviceHandle<Context>,
    in_flight: Option<NonNull<InFlight>>,
}

/// Claimed interface
#[derive(Debug)]
pub struct LibusbInterface {
    number: u8,
    reattach_kernel_driver: bool,
}

/// Event source token
///
/// libusb delivers completions for every handle of a context from the same
/// dispatcher, so registration only records which device it belongs to.
#[derive(Debug)]
pub struct LibusbEventSource {
    bus: u8,
    address: u8,
}

/// Asynchronous control transfer owned by a [`LibusbDevice`]
struct InFlight {
    transfer: NonNull<libusb_transfer>,
    /// Setup packet followed by the data stage
    buffer: Vec<u8>,
    sender: Option<CompletionSender>,
    finished: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // SAFETY: the transfer was allocated by libusb_alloc_transfer and is
        // no longer active when an InFlight is dropped.
        unsafe { libusb_free_transfer(self.transfer.as_ptr()) };
    }
}

extern "system" fn control_finished(transfer_ptr: *mut libusb_transfer) {
    if transfer_ptr.is_null() {
        return;
    }

    // SAFETY: libusb hands back the transfer we submitted.
    let transfer: &libusb_transfer = unsafe { &*transfer_ptr };
    if transfer.user_data.is_null() {
        return;
    }

    // SAFETY: user_data is the InFlight leaked in submit_control; it stays
    // alive until `finished` has been observed by its owning device.
    let in_flight = unsafe { &mut *(transfer.user_data as *mut InFlight) };
    in_flight.finished = true;

    let status = map_transfer_status(transfer.status);
    let length = transfer.actual_length.max(0) as u32;
    let data = in_flight
        .buffer
        .get(ControlSetup::SIZE..)
        .map(<[u8]>::to_vec)
        .unwrap_or_default();

    if let Some(sender) = in_flight.sender.take() {
        // The channel logs a completion nobody waits for
        let _ = sender.complete(Completion {
            status,
            length,
            data,
        });
    }
}

impl LibusbDevice {
    fn in_flight_finished(&self) -> bool {
        match self.in_flight {
            // SAFETY: the pointer stays valid until reap_in_flight frees it.
            Some(ptr) => unsafe { ptr.as_ref().finished },
            None => true,
        }
    }

    /// Free a finished transfer; returns false while one is still active
    fn reap_in_flight(&mut self) -> bool {
        let Some(ptr) = self.in_flight else {
            return true;
        };

        if !self.in_flight_finished() {
            return false;
        }

        self.in_flight = None;
        // SAFETY: the transfer is finished, libusb no longer references it,
        // and the pointer came from Box::into_raw.
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        true
    }

    fn cancel_in_flight(&self) -> Result<()> {
        let Some(ptr) = self.in_flight else {
            return Ok(());
        };

        if self.in_flight_finished() {
            return Ok(());
        }

        // SAFETY: the transfer is submitted and still owned by this device.
        let rc = unsafe { libusb_cancel_transfer(ptr.as_ref().transfer.as_ptr()) };
        match rc {
            // NOT_FOUND: already completing, the callback is on its way
            0 | LIBUSB_ERROR_NOT_FOUND => Ok(()),
            code => Err(Error::platform("abort control pipe", map_libusb_error(code))),
        }
    }

    /// Cancel and wait out any active transfer so its memory can be freed
    fn drain_in_flight(&mut self) {
        if self.reap_in_flight() {
            return;
        }

        if let Err(e) = self.cancel_in_flight() {
            warn!("Failed to cancel in-flight control transfer: {}", e);
        }

        let context = self.handle.context().clone();
        for _ in 0..DRAIN_ATTEMPTS {
            if self.reap_in_flight() {
                return;
            }
            if let Err(e) = context.handle_events(Some(DRAIN_TICK)) {
                debug!("Event handling while draining transfer: {}", e);
            }
        }

        if !self.reap_in_flight() {
            // Freeing an active transfer would hand libusb a dangling buffer
            warn!("Control transfer never completed, leaking its buffer");
            self.in_flight = None;
        }
    }
}

impl Drop for LibusbDevice {
    fn drop(&mut self) {
        self.drain_in_flight();
    }
}

impl UsbPlatform for LibusbPlatform {
    type Candidate = Device<Context>;
    type Device = LibusbDevice;
    type InterfaceRef = u8;
    type Interface = LibusbInterface;
    type EventSource = LibusbEventSource;

    fn find_devices(&self, vendor_id: u16, product_id: u16) -> Result<Vec<Self::Candidate>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::platform("enumerate devices", map_rusb_status(e)))?;

        let matching: Vec<_> = devices
            .iter()
            .filter(|device| {
                device
                    .device_descriptor()
                    .map(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
                    .unwrap_or(false)
            })
            .collect();

        debug!(
            "Found {} device(s) matching {:04x}:{:04x}",
            matching.len(),
            vendor_id,
            product_id
        );
        Ok(matching)
    }

    fn seize_device(&self, candidate: Self::Candidate) -> Result<Self::Device> {
        let handle = candidate
            .open()
            .map_err(|e| Error::platform("seize device", map_rusb_status(e)))?;

        debug!(
            "Opened device bus={} addr={}",
            candidate.bus_number(),
            candidate.address()
        );

        Ok(LibusbDevice {
            handle,
            in_flight: None,
        })
    }

    fn default_configuration(&self, device: &Self::Device) -> Result<u8> {
        let config = device
            .handle
            .device()
            .config_descriptor(0)
            .map_err(|e| Error::platform("read configuration descriptor", map_rusb_status(e)))?;
        Ok(config.number())
    }

    fn set_configuration(&self, device: &mut Self::Device, value: u8) -> Result<()> {
        // Re-selecting the active configuration fails with Busy on Linux
        // while kernel drivers are bound, so only switch when it differs
        if device.handle.active_configuration().ok() == Some(value) {
            debug!("Configuration {} already active", value);
            return Ok(());
        }

        device
            .handle
            .set_active_configuration(value)
            .map_err(|e| Error::platform("set configuration", map_rusb_status(e)))
    }

    fn create_event_source(&self, device: &mut Self::Device) -> Result<Self::EventSource> {
        let usb_device = device.handle.device();
        Ok(LibusbEventSource {
            bus: usb_device.bus_number(),
            address: usb_device.address(),
        })
    }

    fn register_event_source(&self, source: &Self::EventSource) {
        debug!(
            "Event source registered for bus={} addr={}",
            source.bus, source.address
        );
    }

    fn deregister_event_source(&self, source: Self::EventSource) {
        debug!(
            "Event source deregistered for bus={} addr={}",
            source.bus, source.address
        );
    }

    fn close_device(&self, device: &mut Self::Device) -> Result<()> {
        device.drain_in_flight();
        Ok(())
    }

    fn release_device(&self, device: Self::Device) {
        // Dropping the handle calls libusb_close
        drop(device);
    }

    fn interfaces(&self, device: &Self::Device) -> Result<Vec<Self::InterfaceRef>> {
        let config = device
            .handle
            .device()
            .active_config_descriptor()
            .map_err(|e| Error::platform("read active configuration", map_rusb_status(e)))?;

        Ok(config.interfaces().map(|interface| interface.number()).collect())
    }

    fn seize_interface(
        &self,
        device: &mut Self::Device,
        interface: Self::InterfaceRef,
    ) -> Result<Self::Interface> {
        let handle = &mut device.handle;

        let reattach_kernel_driver = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                handle
                    .detach_kernel_driver(interface)
                    .map_err(|e| Error::platform("detach kernel driver", map_rusb_status(e)))?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            if reattach_kernel_driver && let Err(e) = handle.attach_kernel_driver(interface) {
                debug!("Could not reattach kernel driver to interface {}: {}", interface, e);
            }
            return Err(Error::platform("claim interface", map_rusb_status(e)));
        }

        debug!("Claimed interface {}", interface);
        Ok(LibusbInterface {
            number: interface,
            reattach_kernel_driver,
        })
    }

    fn set_alternate_setting(
        &self,
        device: &mut Self::Device,
        interface: &mut Self::Interface,
        alt_setting: u8,
    ) -> Result<()> {
        device
            .handle
            .set_alternate_setting(interface.number, alt_setting)
            .map_err(|e| Error::platform("set alternate setting", map_rusb_status(e)))
    }

    fn close_interface(
        &self,
        device: &mut Self::Device,
        interface: &mut Self::Interface,
    ) -> Result<()> {
        device
            .handle
            .release_interface(interface.number)
            .map_err(|e| Error::platform("release interface", map_rusb_status(e)))
    }

    fn release_interface(&self, device: &mut Self::Device, interface: Self::Interface) {
        if !interface.reattach_kernel_driver {
            return;
        }

        match device.handle.attach_kernel_driver(interface.number) {
            Ok(()) => debug!("Reattached kernel driver to interface {}", interface.number),
            Err(e) => debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface.number, e
            ),
        }
    }

    fn control_transfer(
        &self,
        device: &mut Self::Device,
        setup: &ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> TransferOutcome {
        let result = match setup.direction() {
            Direction::In => device.handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            ),
            Direction::Out => device.handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            ),
        };

        match result {
            Ok(len) => TransferOutcome::new(Status::Success, len as u32),
            Err(e) => TransferOutcome::new(map_rusb_status(e), 0),
        }
    }

    fn submit_control(
        &self,
        device: &mut Self::Device,
        setup: &ControlSetup,
        data: Vec<u8>,
        timeout: Duration,
        completion: CompletionSender,
    ) -> Result<()> {
        if !device.reap_in_flight() {
            return Err(Error::platform("submit control transfer", Status::Busy));
        }

        let mut buffer = Vec::with_capacity(ControlSetup::SIZE + data.len());
        buffer.extend_from_slice(&setup.to_bytes());
        buffer.extend_from_slice(&data);

        // SAFETY: plain allocation, checked for NULL below.
        let transfer = NonNull::new(unsafe { libusb_alloc_transfer(0) }).ok_or(
            Error::platform("allocate transfer", map_libusb_error(LIBUSB_ERROR_NO_MEM)),
        )?;

        let in_flight = Box::into_raw(Box::new(InFlight {
            transfer,
            buffer,
            sender: Some(completion),
            finished: false,
        }));

        let timeout_ms = timeout.as_millis().min(c_uint::MAX as u128) as c_uint;

        // SAFETY: the transfer is freshly allocated and zeroed; the buffer and
        // user_data outlive it because InFlight owns both and is only freed
        // once the callback has run.
        let rc = unsafe {
            let raw = transfer.as_ptr();
            (*raw).dev_handle = device.handle.as_raw();
            (*raw).endpoint = 0;
            (*raw).transfer_type = LIBUSB_TRANSFER_TYPE_CONTROL;
            (*raw).timeout = timeout_ms;
            (*raw).buffer = (*in_flight).buffer.as_mut_ptr();
            (*raw).length = (*in_flight).buffer.len() as c_int;
            (*raw).callback = control_finished;
            (*raw).user_data = in_flight.cast();
            libusb_submit_transfer(raw)
        };

        if rc != 0 {
            // SAFETY: submission failed, libusb holds no reference to it.
            drop(unsafe { Box::from_raw(in_flight) });
            return Err(Error::platform("submit control transfer", map_libusb_error(rc)));
        }

        debug!(
            "Submitted async control transfer: request_type={:#x}, request={:#x}, length={}",
            setup.request_type, setup.request, setup.length
        );
        device.in_flight = NonNull::new(in_flight);
        Ok(())
    }

    fn abort_control_pipe(&self, device: &mut Self::Device) -> Result<()> {
        if device.reap_in_flight() {
            debug!("Default control pipe idle, nothing to abort");
            return Ok(());
        }
        device.cancel_in_flight()
    }

    fn dispatch_events(&self, _source: &Self::EventSource, timeout: Duration) -> Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as _,
            tv_usec: timeout.subsec_micros() as _,
        };

        // SAFETY: the context is alive for the duration of the call.
        let rc = unsafe {
            libusb_handle_events_timeout_completed(self.context.as_raw(), &tv, ptr::null_mut())
        };

        match rc {
            0 | LIBUSB_ERROR_INTERRUPTED => Ok(()),
            code => Err(Error::platform("dispatch events", map_libusb_error(code))),
        }
    }

    fn reset_device(&self, device: &mut Self::Device) -> Result<()> {
        match device.handle.reset() {
            Ok(()) => Ok(()),
            // libusb re-enumerated the device as part of the reset
            Err(rusb::Error::NotFound) => {
                debug!("Device re-enumerated during reset");
                Ok(())
            }
            Err(e) => Err(Error::platform("reset device", map_rusb_status(e))),
        }
    }

    fn reenumerate_device(&self, _device: &mut Self::Device) -> Result<()> {
        // libusb_reset_device already triggers re-enumeration when the
        // descriptors changed; there is no separate request to issue
        debug!("Re-enumeration handled by reset");
        Ok(())
    }
}

/// Map rusb::Error to a platform-independent status
pub fn map_rusb_status(err: rusb::Error) -> Status {
    match err {
        rusb::Error::Timeout => Status::Timeout,
        rusb::Error::Pipe => Status::Stalled,
        rusb::Error::NoDevice => Status::NoDevice,
        rusb::Error::NotFound => Status::NotFound,
        rusb::Error::Busy => Status::Busy,
        rusb::Error::Overflow => Status::Overflow,
        rusb::Error::Io => Status::Io,
        rusb::Error::InvalidParam => Status::InvalidParam,
        rusb::Error::Access => Status::Access,
        rusb::Error::NotSupported => Status::NotSupported,
        rusb::Error::Interrupted => Status::Other(LIBUSB_ERROR_INTERRUPTED),
        rusb::Error::NoMem => Status::Other(LIBUSB_ERROR_NO_MEM),
        _ => Status::Other(LIBUSB_ERROR_OTHER),
    }
}

/// Map a libusb error code (negative return value) to a status
fn map_libusb_error(code: c_int) -> Status {
    match code {
        LIBUSB_ERROR_IO => Status::Io,
        LIBUSB_ERROR_INVALID_PARAM => Status::InvalidParam,
        LIBUSB_ERROR_ACCESS => Status::Access,
        LIBUSB_ERROR_NO_DEVICE => Status::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => Status::NotFound,
        LIBUSB_ERROR_BUSY => Status::Busy,
        LIBUSB_ERROR_TIMEOUT => Status::Timeout,
        LIBUSB_ERROR_OVERFLOW => Status::Overflow,
        LIBUSB_ERROR_PIPE => Status::Stalled,
        LIBUSB_ERROR_NOT_SUPPORTED => Status::NotSupported,
        other => Status::Other(other),
    }
}

/// Map a libusb transfer completion status
fn map_transfer_status(status: c_int) -> Status {
    match status {
        LIBUSB_TRANSFER_COMPLETED => Status::Success,
        LIBUSB_TRANSFER_CANCELLED => Status::Aborted,
        LIBUSB_TRANSFER_TIMED_OUT => Status::Timeout,
        LIBUSB_TRANSFER_STALL => Status::Stalled,
        LIBUSB_TRANSFER_NO_DEVICE => Status::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => Status::Overflow,
        LIBUSB_TRANSFER_ERROR => Status::Io,
        other => Status::Other(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{TransferState, classify};

    #[test]
    fn test_map_rusb_status() {
        assert_eq!(map_rusb_status(rusb::Error::Timeout), Status::Timeout);
        assert_eq!(map_rusb_status(rusb::Error::Pipe), Status::Stalled);
        assert_eq!(map_rusb_status(rusb::Error::NoDevice), Status::NoDevice);
        assert_eq!(map_rusb_status(rusb::Error::Busy), Status::Busy);
    }

    #[test]
    fn test_transfer_status_classification() {
        // A cancelled transfer is how an aborted async wait ends
        assert_eq!(
            classify(map_transfer_status(LIBUSB_TRANSFER_CANCELLED)),
            TransferState::Ok
        );
        assert_eq!(
            classify(map_transfer_status(LIBUSB_TRANSFER_TIMED_OUT)),
            TransferState::Ok
        );
        assert_eq!(
            classify(map_transfer_status(LIBUSB_TRANSFER_STALL)),
            TransferState::Stall
        );
        assert_eq!(
            classify(map_transfer_status(LIBUSB_TRANSFER_NO_DEVICE)),
            TransferState::Error
        );
    }

    #[test]
    fn test_map_libusb_error() {
        assert_eq!(map_libusb_error(LIBUSB_ERROR_PIPE), Status::Stalled);
        assert_eq!(map_libusb_error(LIBUSB_ERROR_NOT_FOUND), Status::NotFound);
        assert_eq!(map_libusb_error(-1234), Status::Other(-1234));
    }

    #[test]
    fn test_platform_creation() {
        // Context creation may fail in sandboxes without USB access
        match LibusbPlatform::new() {
            Ok(platform) => {
                let _ = platform.find_devices(0xffff, 0xffff);
            }
            Err(e) => {
                eprintln!("libusb context unavailable (expected without USB): {}", e);
            }
        }
    }
}
