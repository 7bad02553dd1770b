//! usb-ctrl client library
//!
//! Waits for a USB device by vendor/product, claims one of its interfaces
//! exclusively, and drives control transfers on its default pipe, either
//! blocking or with a bounded wait that aborts the transfer when it runs
//! over.
//!
//! # Example
//!
//! ```no_run
//! use client::{LibusbPlatform, Session};
//! use protocol::{ControlSetup, TransferState};
//!
//! # fn main() -> common::Result<()> {
//! let mut session = Session::new(LibusbPlatform::new()?, 0x1234, 0x5678);
//! session.connect_default()?;
//!
//! let mut descriptor = [0u8; 18];
//! let setup = ControlSetup::new(0x80, 0x06, 0x0100, 0, 18);
//! let result = session.transfer(setup, Some(&mut descriptor));
//! assert_eq!(result.state, TransferState::Ok);
//!
//! session.disconnect()?;
//! # Ok(())
//! # }
//! ```

pub mod claimer;
pub mod config;
pub mod matcher;
pub mod platform;
pub mod session;
pub mod test_utils;
pub mod transfers;

pub use claimer::{Connection, NEGOTIATED_ALT_SETTING, OpenDevice, close_device, close_interface};
pub use config::ClientConfig;
pub use matcher::{CancelToken, ConnectOptions, DEFAULT_RETRY_INTERVAL};
pub use platform::{LibusbPlatform, TransferOutcome, UsbPlatform};
pub use session::{Session, SessionOptions};
pub use transfers::DEFAULT_CONTROL_TIMEOUT;
