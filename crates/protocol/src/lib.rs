//! Control-transfer data model for usb-ctrl
//!
//! This crate defines the types exchanged between applications, the session
//! layer and platform backends: control setup packets, raw completion
//! statuses, the classified [`TransferResult`] and the `vid:pid` device
//! selector.
//!
//! # Example
//!
//! ```
//! use protocol::{Status, TransferResult, TransferState};
//!
//! // An aborted transfer is an expected outcome, not a failure
//! let result = TransferResult::from_status(Status::Aborted, 4);
//! assert_eq!(result.state, TransferState::Ok);
//! assert_eq!(result.length, 4);
//!
//! let stalled = TransferResult::from_status(Status::Stalled, 0);
//! assert_eq!(stalled.state, TransferState::Stall);
//! ```

pub mod error;
pub mod status;
pub mod types;

pub use error::SelectorError;
pub use status::{Status, classify};
pub use types::{ControlSetup, DeviceSelector, Direction, TransferResult, TransferState};
