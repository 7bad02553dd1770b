//! Control transfer type definitions
//!
//! This module defines the data model shared by the session, the transfer
//! engine and platform backends: the setup stage of a control request, the
//! classified result of a transfer and the vendor/product selector used for
//! device discovery.

use crate::error::SelectorError;
use crate::status::{Status, classify};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Terminal classification of one transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// Completed, aborted or timed out
    Ok,
    /// Endpoint stalled; the caller may clear the halt and retry
    Stall,
    /// Any other failure
    Error,
}

/// Result of a single control transfer
///
/// `length` is the number of bytes actually moved. A transfer that could not
/// be dispatched at all is reported as [`TransferResult::DISPATCH_FAILED`],
/// which is distinct from a dispatched transfer that moved zero bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    /// Classified state
    pub state: TransferState,
    /// Bytes transferred
    pub length: u32,
}

impl TransferResult {
    /// Sentinel for a transfer that never reached the device
    pub const DISPATCH_FAILED: TransferResult = TransferResult {
        state: TransferState::Error,
        length: u32::MAX,
    };

    /// Build a result from a raw completion status
    pub fn from_status(status: Status, length: u32) -> Self {
        Self {
            state: classify(status),
            length,
        }
    }

    /// True if this is the dispatch-failure sentinel
    pub fn is_dispatch_failure(&self) -> bool {
        *self == Self::DISPATCH_FAILED
    }

    /// True if the transfer was classified `Ok`
    pub fn is_ok(&self) -> bool {
        self.state == TransferState::Ok
    }
}

/// Data stage direction, from bit 7 of `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Setup stage of a control request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSetup {
    /// Request type byte (bmRequestType)
    pub request_type: u8,
    /// Request byte (bRequest)
    pub request: u8,
    /// Value parameter (wValue)
    pub value: u16,
    /// Index parameter (wIndex)
    pub index: u16,
    /// Data stage length (wLength)
    pub length: u16,
}

impl ControlSetup {
    /// Size of the setup packet on the wire
    pub const SIZE: usize = 8;

    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Encode the setup packet (multi-byte fields little-endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

/// Vendor/product pair identifying the device to connect to
///
/// Parsed from `"vid:pid"` with hexadecimal fields, each optionally prefixed
/// with `0x` (e.g. `"1234:5678"` or `"0x05ac:0x1227"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSelector {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
}

impl DeviceSelector {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    fn parse_field(field: &str) -> Result<u16, SelectorError> {
        let trimmed = field.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() {
            return Err(SelectorError::EmptyField);
        }

        u16::from_str_radix(digits, 16).map_err(|_| SelectorError::InvalidHex {
            field: trimmed.to_string(),
        })
    }
}

impl FromStr for DeviceSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| SelectorError::MissingSeparator {
                input: s.to_string(),
            })?;

        Ok(Self {
            vendor_id: Self::parse_field(vid)?,
            product_id: Self::parse_field(pid)?,
        })
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_failure_sentinel() {
        let sentinel = TransferResult::DISPATCH_FAILED;
        assert!(sentinel.is_dispatch_failure());
        assert_eq!(sentinel.state, TransferState::Error);

        // A dispatched transfer that moved nothing is not the sentinel
        let empty = TransferResult::from_status(Status::Success, 0);
        assert!(!empty.is_dispatch_failure());
        assert!(empty.is_ok());

        // Neither is a genuine error with a real length
        let failed = TransferResult::from_status(Status::Io, 0);
        assert!(!failed.is_dispatch_failure());
        assert_eq!(failed.state, TransferState::Error);
    }

    #[test]
    fn test_setup_direction() {
        assert_eq!(ControlSetup::new(0x80, 6, 0x0100, 0, 18).direction(), Direction::In);
        assert_eq!(ControlSetup::new(0x21, 9, 0, 0, 8).direction(), Direction::Out);
    }

    #[test]
    fn test_setup_bytes_little_endian() {
        let setup = ControlSetup::new(0xc0, 0x01, 0x1234, 0xabcd, 0x0040);
        assert_eq!(
            setup.to_bytes(),
            [0xc0, 0x01, 0x34, 0x12, 0xcd, 0xab, 0x40, 0x00]
        );
    }

    #[test]
    fn test_selector_parse() {
        let sel: DeviceSelector = "1234:5678".parse().unwrap();
        assert_eq!(sel, DeviceSelector::new(0x1234, 0x5678));

        let sel: DeviceSelector = "0x05AC:0x1227".parse().unwrap();
        assert_eq!(sel, DeviceSelector::new(0x05ac, 0x1227));
        assert_eq!(sel.to_string(), "05ac:1227");
    }

    #[test]
    fn test_selector_parse_errors() {
        assert!(matches!(
            "12345678".parse::<DeviceSelector>(),
            Err(SelectorError::MissingSeparator { .. })
        ));
        assert!(matches!(
            "0x:1234".parse::<DeviceSelector>(),
            Err(SelectorError::EmptyField)
        ));
        assert!(matches!(
            "zzzz:1234".parse::<DeviceSelector>(),
            Err(SelectorError::InvalidHex { .. })
        ));
        assert!(matches!(
            "1:fffff".parse::<DeviceSelector>(),
            Err(SelectorError::InvalidHex { .. })
        ));
    }
}
