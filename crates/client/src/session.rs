//! Connection session
//!
//! A [`Session`] is bound to one vendor/product pair for its whole life and
//! moves between two states: closed (no handles) and open (device,
//! event source and interface all held). Every operation leaves it in one
//! of those two states.

use crate::claimer::{Connection, close_connection};
use crate::matcher::{ConnectOptions, find_and_claim};
use crate::platform::UsbPlatform;
use crate::transfers::{DEFAULT_CONTROL_TIMEOUT, control_transfer, control_transfer_async};
use common::{Error, Result};
use protocol::{ControlSetup, DeviceSelector, TransferResult};
use std::time::Duration;
use tracing::{info, warn};

/// Per-session tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Timeout applied to every control transfer
    pub control_timeout: Duration,
    /// Discovery loop parameters used by [`Session::connect`]
    pub connect: ConnectOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            connect: ConnectOptions::default(),
        }
    }
}

/// Session with a single USB device
pub struct Session<P: UsbPlatform> {
    vendor_id: u16,
    product_id: u16,
    platform: P,
    options: SessionOptions,
    connection: Option<Connection<P>>,
}

impl<P: UsbPlatform> Session<P> {
    /// Create a closed session for a vendor/product pair
    pub fn new(platform: P, vendor_id: u16, product_id: u16) -> Self {
        Self::with_options(platform, vendor_id, product_id, SessionOptions::default())
    }

    pub fn with_options(
        platform: P,
        vendor_id: u16,
        product_id: u16,
        options: SessionOptions,
    ) -> Self {
        Self {
            vendor_id,
            product_id,
            platform,
            options,
            connection: None,
        }
    }

    pub fn for_selector(platform: P, selector: DeviceSelector, options: SessionOptions) -> Self {
        Self::with_options(platform, selector.vendor_id, selector.product_id, options)
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// True while the device is open
    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// True while an interface is claimed (implies [`Session::is_open`])
    pub fn has_interface(&self) -> bool {
        self.connection.is_some()
    }

    /// Wait for the device and claim interface `index`
    ///
    /// Uses the discovery parameters from the session options.
    pub fn connect(&mut self, index: u8, alt_setting: u8) -> Result<()> {
        let options = self.options.connect.clone();
        self.connect_with(index, alt_setting, &options)
    }

    pub fn connect_with(
        &mut self,
        index: u8,
        alt_setting: u8,
        options: &ConnectOptions,
    ) -> Result<()> {
        if self.connection.is_some() {
            return Err(Error::InvalidState("session is already connected"));
        }

        info!(
            "Waiting for device {:04x}:{:04x} (interface {}, alt setting {})",
            self.vendor_id, self.product_id, index, alt_setting
        );

        let connection = find_and_claim(
            &self.platform,
            self.vendor_id,
            self.product_id,
            index,
            alt_setting,
            options,
        )?;
        self.connection = Some(connection);

        info!("Connected to {:04x}:{:04x}", self.vendor_id, self.product_id);
        Ok(())
    }

    /// Connect to interface 0 without alternate setting negotiation
    pub fn connect_default(&mut self) -> Result<()> {
        self.connect(0, 0)
    }

    /// Close the interface, then the device
    pub fn disconnect(&mut self) -> Result<()> {
        let connection = self
            .connection
            .take()
            .ok_or(Error::InvalidState("session is not connected"))?;

        close_connection(&self.platform, connection);
        info!("Disconnected from {:04x}:{:04x}", self.vendor_id, self.product_id);
        Ok(())
    }

    /// Reset the device and request re-enumeration
    ///
    /// The handles are invalid afterwards whether or not the reset worked,
    /// so the session is closed in both cases.
    pub fn reset(&mut self) -> Result<()> {
        let mut connection = self
            .connection
            .take()
            .ok_or(Error::InvalidState("session is not connected"))?;

        let handle = &mut connection.device.handle;
        let result = self
            .platform
            .reset_device(handle)
            .and_then(|()| self.platform.reenumerate_device(handle));

        close_connection(&self.platform, connection);

        match &result {
            Ok(()) => info!("Reset {:04x}:{:04x}", self.vendor_id, self.product_id),
            Err(e) => warn!(
                "Reset of {:04x}:{:04x} failed: {}",
                self.vendor_id, self.product_id, e
            ),
        }
        result
    }

    /// Reset, then wait for the device to come back on interface 0
    pub fn reconnect(&mut self) -> Result<()> {
        self.reset()?;
        self.connect_default()
    }

    /// Synchronous control transfer
    ///
    /// Without `data`, `setup.length` zero bytes are sent. A closed session
    /// yields [`TransferResult::DISPATCH_FAILED`].
    pub fn transfer(&mut self, setup: ControlSetup, data: Option<&mut [u8]>) -> TransferResult {
        let Some(connection) = self.connection.as_mut() else {
            warn!("Control transfer on a closed session");
            return TransferResult::DISPATCH_FAILED;
        };

        control_transfer(
            &self.platform,
            &mut connection.device.handle,
            setup,
            data,
            self.options.control_timeout,
        )
    }

    /// Control transfer bounded by `timeout`
    ///
    /// Returns after roughly `timeout` at most, aborting the transfer if it
    /// has not completed by then.
    pub fn transfer_async(
        &mut self,
        setup: ControlSetup,
        data: Option<&mut [u8]>,
        timeout: Duration,
    ) -> TransferResult {
        let Some(connection) = self.connection.as_mut() else {
            warn!("Async control transfer on a closed session");
            return TransferResult::DISPATCH_FAILED;
        };

        let device = &mut connection.device;
        control_transfer_async(
            &self.platform,
            &mut device.handle,
            &device.event_source,
            setup,
            data,
            self.options.control_timeout,
            timeout,
        )
    }
}

impl<P: UsbPlatform> Drop for Session<P> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            close_connection(&self.platform, connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Call, MockDevice, MockPlatform};

    #[test]
    fn test_new_session_is_closed() {
        let session = Session::new(MockPlatform::new(), 0x1234, 0x5678);
        assert_eq!(session.vendor_id(), 0x1234);
        assert_eq!(session.product_id(), 0x5678);
        assert!(!session.is_open());
        assert!(!session.has_interface());
    }

    #[test]
    fn test_connect_twice_is_invalid() {
        let platform = MockPlatform::new().with_devices(vec![MockDevice::new(1), MockDevice::new(2)]);
        let mut session = Session::new(platform, 0x1234, 0x5678);

        session.connect_default().unwrap();
        assert!(matches!(
            session.connect_default(),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(session.platform().outstanding_devices(), 1);
    }

    #[test]
    fn test_drop_disconnects() {
        let platform = MockPlatform::new().with_devices(vec![MockDevice::new(1)]);
        {
            let mut session = Session::new(platform.clone(), 0x1234, 0x5678);
            session.connect_default().unwrap();
        }
        assert_eq!(platform.outstanding_devices(), 0);
        assert_eq!(platform.outstanding_interfaces(), 0);
        assert!(platform.calls().contains(&Call::DeregisterEventSource(1)));
    }

    #[test]
    fn test_transfer_on_closed_session() {
        let platform = MockPlatform::new();
        let mut session = Session::new(platform.clone(), 0x1234, 0x5678);

        let setup = ControlSetup::new(0x80, 0x06, 0x0100, 0, 18);
        assert!(session.transfer(setup, None).is_dispatch_failure());
        assert!(
            session
                .transfer_async(setup, None, Duration::from_millis(5))
                .is_dispatch_failure()
        );
        assert!(platform.calls().is_empty());
    }
}
