//! Raw completion status and transfer classification
//!
//! Every platform backend reports the outcome of a USB operation as a
//! [`Status`]. The classifier folds those statuses into the three states that
//! callers actually branch on.

use crate::types::TransferState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform-independent completion status of a USB operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Operation completed
    Success,
    /// Transfer was aborted before it completed (explicit abort or cancel)
    Aborted,
    /// Transport-level timeout
    Timeout,
    /// Transaction timeout reported by the host controller
    TransactionTimeout,
    /// Endpoint halted (pipe stall)
    Stalled,
    /// Device was disconnected
    NoDevice,
    /// Device or interface is held by another client
    Busy,
    /// Entity not found
    NotFound,
    /// Insufficient permissions
    Access,
    /// Device sent more data than requested
    Overflow,
    /// Invalid parameter
    InvalidParam,
    /// Operation not supported on this platform
    NotSupported,
    /// Input/output error
    Io,
    /// Any other platform code
    Other(i32),
}

impl Status {
    /// Returns true for [`Status::Success`]
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Aborted => write!(f, "aborted"),
            Status::Timeout => write!(f, "timeout"),
            Status::TransactionTimeout => write!(f, "transaction timeout"),
            Status::Stalled => write!(f, "pipe stalled"),
            Status::NoDevice => write!(f, "no device"),
            Status::Busy => write!(f, "busy"),
            Status::NotFound => write!(f, "not found"),
            Status::Access => write!(f, "access denied"),
            Status::Overflow => write!(f, "overflow"),
            Status::InvalidParam => write!(f, "invalid parameter"),
            Status::NotSupported => write!(f, "not supported"),
            Status::Io => write!(f, "I/O error"),
            Status::Other(code) => write!(f, "platform error {}", code),
        }
    }
}

/// Classify a raw completion status
///
/// Aborts and timeouts are the expected terminal conditions of an async
/// transfer that gets aborted after its wait window, so they count as `Ok`.
pub fn classify(status: Status) -> TransferState {
    match status {
        Status::Success | Status::Aborted | Status::Timeout | Status::TransactionTimeout => {
            TransferState::Ok
        }
        Status::Stalled => TransferState::Stall,
        _ => TransferState::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_class() {
        assert_eq!(classify(Status::Success), TransferState::Ok);
        assert_eq!(classify(Status::Aborted), TransferState::Ok);
        assert_eq!(classify(Status::Timeout), TransferState::Ok);
        assert_eq!(classify(Status::TransactionTimeout), TransferState::Ok);
    }

    #[test]
    fn test_stall() {
        assert_eq!(classify(Status::Stalled), TransferState::Stall);
    }

    #[test]
    fn test_everything_else_is_error() {
        for status in [
            Status::NoDevice,
            Status::Busy,
            Status::NotFound,
            Status::Access,
            Status::Overflow,
            Status::InvalidParam,
            Status::NotSupported,
            Status::Io,
            Status::Other(-99),
        ] {
            assert_eq!(classify(status), TransferState::Error, "{:?}", status);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::Stalled.to_string(), "pipe stalled");
        assert_eq!(Status::Other(7).to_string(), "platform error 7");
    }
}
