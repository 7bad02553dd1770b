//! Common error types

use protocol::Status;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A platform primitive failed; `op` names the step
    #[error("USB error during {op}: {status}")]
    Platform { op: &'static str, status: Status },

    #[error("Invalid session state: {0}")]
    InvalidState(&'static str),

    #[error("Interface {index} not found ({available} available)")]
    InterfaceNotFound { index: u8, available: usize },

    #[error("Device discovery deadline exceeded")]
    DeadlineExceeded,

    #[error("Device discovery cancelled")]
    Cancelled,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn platform(op: &'static str, status: Status) -> Self {
        Error::Platform { op, status }
    }

    /// Underlying platform status, if this error carries one
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Platform { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for failures the discovery loop absorbs and retries
    ///
    /// A device held by another client or one that vanished mid-scan is
    /// skipped rather than reported.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.status(),
            Some(Status::Busy | Status::Access | Status::NoDevice | Status::NotFound)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
