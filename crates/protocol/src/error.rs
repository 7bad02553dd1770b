//! Parse error types

use thiserror::Error;

/// Errors produced when parsing a `vid:pid` device selector
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    /// The input has no `:` between vendor and product
    #[error("Expected 'vid:pid', got '{input}'")]
    MissingSeparator { input: String },

    /// One side of the selector is empty
    #[error("Empty vendor or product field")]
    EmptyField,

    /// A field is not a 16-bit hexadecimal number
    #[error("Invalid hexadecimal ID '{field}'")]
    InvalidHex { field: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SelectorError::MissingSeparator {
            input: "abcd".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("vid:pid"));
        assert!(msg.contains("abcd"));
    }
}
