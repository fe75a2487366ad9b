//! Parse errors for wire-protocol data.

use thiserror::Error;

/// Errors raised while decoding bytes received from a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Not enough bytes for the expected layout.
    #[error("insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes actually received.
        actual: usize,
    },

    /// A field held a value outside its valid range.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The packet kind byte is not one we know how to decode.
    #[error("unknown packet kind: 0x{0:02X}")]
    UnknownPacketKind(u8),

    /// The command id byte does not name a known command.
    #[error("unknown command id: 0x{0:02X}")]
    UnknownCommand(u8),

    /// An advertised name did not resolve to a known sensor position.
    #[error("advertised name '{0}' does not match a known sensor position")]
    UnknownDevicePattern(String),
}

impl ParseError {
    /// Convenience constructor for [`ParseError::InsufficientBytes`].
    pub fn insufficient(expected: usize, actual: usize) -> Self {
        Self::InsufficientBytes { expected, actual }
    }
}

/// Result type alias for parsing operations.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ParseError::insufficient(16, 7);
        assert!(err.to_string().contains("expected 16"));
        assert!(err.to_string().contains("got 7"));

        let err = ParseError::UnknownPacketKind(0x7F);
        assert_eq!(err.to_string(), "unknown packet kind: 0x7F");

        let err = ParseError::UnknownDevicePattern("KNEE-99".into());
        assert!(err.to_string().contains("KNEE-99"));
    }
}
