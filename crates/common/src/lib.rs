//! Common utilities for usb-ctrl
//!
//! This crate provides shared functionality for the client library and the
//! command-line tool: the error type, logging setup, and the completion
//! channel that bridges platform transfer callbacks into blocking waits.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{Completion, CompletionReceiver, CompletionSender, completion_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
