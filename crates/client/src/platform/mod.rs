//! Host USB stack capabilities
//!
//! The session layer never talks to an operating system API directly. It
//! drives a [`UsbPlatform`], which exposes the handful of primitives the
//! connection state machine and transfer engine need:
//! - Device enumeration filtered by vendor/product
//! - Exclusive device open, configuration selection, close and release
//! - An event source and a bounded run of the platform's event dispatcher
//! - Interface enumeration, exclusive claim, alternate setting selection
//! - Synchronous control transfers with a timeout
//! - Asynchronous control transfers plus an abort of the default pipe
//! - Device reset and re-enumeration
//!
//! Handles are associated types so each backend keeps its own ownership
//! model. Close and release are separate steps: close ends the exclusive
//! claim, release frees the handle itself.

pub mod libusb;

pub use libusb::LibusbPlatform;

use common::{CompletionSender, Result};
use protocol::{ControlSetup, Status};
use std::time::Duration;

/// Raw outcome of a synchronous control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Completion status reported by the platform
    pub status: Status,
    /// Bytes moved in the data stage
    pub length: u32,
}

impl TransferOutcome {
    pub fn new(status: Status, length: u32) -> Self {
        Self { status, length }
    }
}

/// Capability interface over a host USB stack
pub trait UsbPlatform {
    /// Enumerated device that has not been opened yet
    type Candidate;
    /// Open device handle
    type Device;
    /// Entry of a device's interface enumeration
    type InterfaceRef;
    /// Open interface handle
    type Interface;
    /// Registration with the platform's event dispatcher
    type EventSource;

    /// All currently present devices with this vendor/product pair
    fn find_devices(&self, vendor_id: u16, product_id: u16) -> Result<Vec<Self::Candidate>>;

    /// Open a device exclusively, preempting non-exclusive clients
    fn seize_device(&self, candidate: Self::Candidate) -> Result<Self::Device>;

    /// Configuration value of the device's default configuration
    fn default_configuration(&self, device: &Self::Device) -> Result<u8>;

    fn set_configuration(&self, device: &mut Self::Device, value: u8) -> Result<()>;

    /// Create the source through which async completions are delivered
    fn create_event_source(&self, device: &mut Self::Device) -> Result<Self::EventSource>;

    fn register_event_source(&self, source: &Self::EventSource);

    /// Remove the source from the dispatcher and release it
    fn deregister_event_source(&self, source: Self::EventSource);

    /// End the exclusive open
    fn close_device(&self, device: &mut Self::Device) -> Result<()>;

    /// Release the device handle
    fn release_device(&self, device: Self::Device);

    /// Interfaces of the active configuration, in enumeration order
    fn interfaces(&self, device: &Self::Device) -> Result<Vec<Self::InterfaceRef>>;

    fn seize_interface(
        &self,
        device: &mut Self::Device,
        interface: Self::InterfaceRef,
    ) -> Result<Self::Interface>;

    fn set_alternate_setting(
        &self,
        device: &mut Self::Device,
        interface: &mut Self::Interface,
        alt_setting: u8,
    ) -> Result<()>;

    fn close_interface(&self, device: &mut Self::Device, interface: &mut Self::Interface)
    -> Result<()>;

    fn release_interface(&self, device: &mut Self::Device, interface: Self::Interface);

    /// Blocking control transfer on the default pipe
    ///
    /// `data` is exactly the data stage: written for OUT requests, filled for
    /// IN requests.
    fn control_transfer(
        &self,
        device: &mut Self::Device,
        setup: &ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> TransferOutcome;

    /// Start a control transfer whose completion is delivered through
    /// `completion` from inside [`UsbPlatform::dispatch_events`]
    ///
    /// The platform owns `data` until the completion hands it back.
    fn submit_control(
        &self,
        device: &mut Self::Device,
        setup: &ControlSetup,
        data: Vec<u8>,
        timeout: Duration,
        completion: CompletionSender,
    ) -> Result<()>;

    /// Abort whatever is pending on the default control pipe
    ///
    /// Aborted transfers still complete, with [`Status::Aborted`].
    fn abort_control_pipe(&self, device: &mut Self::Device) -> Result<()>;

    /// Run the event dispatcher for at most `timeout`
    fn dispatch_events(&self, source: &Self::EventSource, timeout: Duration) -> Result<()>;

    fn reset_device(&self, device: &mut Self::Device) -> Result<()>;

    fn reenumerate_device(&self, device: &mut Self::Device) -> Result<()>;
}
