//! Device and interface claiming
//!
//! Opens a matched device exclusively, applies its default configuration,
//! registers the async completion event source, then opens the requested
//! interface. Every step that fails after something was acquired gives that
//! resource back before the error is returned, so callers only ever see a
//! fully opened device or nothing.

use crate::platform::UsbPlatform;
use common::{Error, Result};
use tracing::{debug, warn};

/// The only alternate setting value that triggers negotiation
///
/// Any other value keeps the interface's current setting.
pub const NEGOTIATED_ALT_SETTING: u8 = 1;

/// Exclusively opened and configured device with its event source
pub struct OpenDevice<P: UsbPlatform> {
    pub(crate) handle: P::Device,
    pub(crate) event_source: P::EventSource,
}

/// Live connection: open device plus the claimed interface
pub struct Connection<P: UsbPlatform> {
    pub(crate) device: OpenDevice<P>,
    pub(crate) interface: P::Interface,
}

/// Open a candidate device exclusively and prepare it for transfers
pub fn open_device<P: UsbPlatform>(platform: &P, candidate: P::Candidate) -> Result<OpenDevice<P>> {
    let mut handle = platform.seize_device(candidate)?;

    match configure_device(platform, &mut handle) {
        Ok(event_source) => {
            platform.register_event_source(&event_source);
            Ok(OpenDevice {
                handle,
                event_source,
            })
        }
        Err(e) => {
            debug!("Device configuration failed, closing: {}", e);
            discard_device(platform, handle);
            Err(e)
        }
    }
}

fn configure_device<P: UsbPlatform>(platform: &P, handle: &mut P::Device) -> Result<P::EventSource> {
    let configuration = platform.default_configuration(handle)?;
    platform.set_configuration(handle, configuration)?;
    debug!("Selected configuration {}", configuration);
    platform.create_event_source(handle)
}

/// Open the interface at enumeration position `index`
///
/// Interfaces are matched by position only. The alternate setting is
/// negotiated only when `alt_setting` is [`NEGOTIATED_ALT_SETTING`].
pub fn open_interface<P: UsbPlatform>(
    platform: &P,
    device: &mut P::Device,
    index: u8,
    alt_setting: u8,
) -> Result<P::Interface> {
    let interfaces = platform.interfaces(device)?;
    let available = interfaces.len();

    let Some(target) = interfaces.into_iter().nth(index as usize) else {
        return Err(Error::InterfaceNotFound { index, available });
    };

    let mut interface = platform.seize_interface(device, target)?;
    debug!("Opened interface {} of {}", index, available);

    if alt_setting != NEGOTIATED_ALT_SETTING {
        return Ok(interface);
    }

    match platform.set_alternate_setting(device, &mut interface, alt_setting) {
        Ok(()) => {
            debug!("Selected alternate setting {}", alt_setting);
            Ok(interface)
        }
        Err(e) => {
            discard_interface(platform, device, interface);
            Err(e)
        }
    }
}

/// Close then release an interface
pub fn close_interface<P: UsbPlatform>(
    platform: &P,
    device: &mut P::Device,
    interface: P::Interface,
) {
    discard_interface(platform, device, interface);
}

/// Deregister the event source, then close and release the device
pub fn close_device<P: UsbPlatform>(platform: &P, device: OpenDevice<P>) {
    let OpenDevice {
        handle,
        event_source,
    } = device;

    platform.deregister_event_source(event_source);
    discard_device(platform, handle);
}

/// Tear down a full connection, interface first
pub(crate) fn close_connection<P: UsbPlatform>(platform: &P, connection: Connection<P>) {
    let Connection {
        mut device,
        interface,
    } = connection;

    close_interface(platform, &mut device.handle, interface);
    close_device(platform, device);
}

fn discard_interface<P: UsbPlatform>(platform: &P, device: &mut P::Device, mut interface: P::Interface) {
    if let Err(e) = platform.close_interface(device, &mut interface) {
        warn!("Failed to close interface: {}", e);
    }
    platform.release_interface(device, interface);
}

fn discard_device<P: UsbPlatform>(platform: &P, mut handle: P::Device) {
    if let Err(e) = platform.close_device(&mut handle) {
        warn!("Failed to close device: {}", e);
    }
    platform.release_device(handle);
}
