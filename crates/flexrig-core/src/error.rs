//! Error types for flexrig-core.

use std::time::Duration;

use thiserror::Error;

use flexrig_types::{DeviceId, DeviceState, FirmwareState, ParseError};

/// Errors that can occur while operating the capture rig.
///
/// Marked `#[non_exhaustive]` so new variants can be added without
/// breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error from the radio stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The transport was used before `initialize` succeeded.
    #[error("transport not initialized")]
    NotInitialized,

    /// A scan could not be started or stopped.
    #[error("scan failed: {0}")]
    ScanFailed(String),

    /// The peripheral is not in the transport cache, likely out of range.
    #[error("device unavailable: {address}")]
    DeviceUnavailable {
        /// Radio address that could not be resolved.
        address: String,
    },

    /// A connection attempt failed.
    #[error("connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Radio address of the peripheral.
        address: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Reconnection attempts were exhausted.
    #[error("max reconnect attempts exceeded for {device}")]
    MaxReconnectExceeded {
        /// The device that gave up reconnecting.
        device: DeviceId,
    },

    /// The vendor service or its characteristics were not found.
    #[error("GATT setup failed on {address}: {message}")]
    GattSetupFailed {
        /// Radio address of the peripheral.
        address: String,
        /// What was missing or failed.
        message: String,
    },

    /// A lifecycle transition outside the allowed graph was requested.
    #[error("invalid state transition for {device}: {from} -> {to}")]
    InvalidTransition {
        /// The device whose transition was rejected.
        device: DeviceId,
        /// Current state.
        from: DeviceState,
        /// Requested state.
        to: DeviceState,
    },

    /// A command did not receive its response in time.
    #[error("command {command} timed out after {duration:?}")]
    CommandTimeout {
        /// Command name.
        command: &'static str,
        /// How long we waited.
        duration: Duration,
    },

    /// A received packet failed size or framing validation.
    #[error("invalid packet: {0}")]
    InvalidPacket(#[from] ParseError),

    /// Time synchronization failed for a device.
    #[error("time sync failed for {device}: {message}")]
    SyncFailed {
        /// The device that failed to sync.
        device: DeviceId,
        /// Why.
        message: String,
    },

    /// Streaming was requested from an incompatible firmware state.
    #[error("{device} not ready for streaming (firmware state {state:?})")]
    NotReadyForStreaming {
        /// The device that refused.
        device: DeviceId,
        /// The firmware state it reported.
        state: FirmwareState,
    },

    /// Streaming was started while already active.
    #[error("streaming already active")]
    StreamingAlreadyActive,

    /// A joint computation received sensors that do not form a valid
    /// proximal/distal pair.
    #[error("invalid sensor pair: {0}")]
    InvalidSensorPair(String),

    /// An advertised name did not resolve to a known sensor position.
    #[error("unknown device pattern: '{name}'")]
    UnknownDevicePattern {
        /// The advertised name that was rejected.
        name: String,
    },

    /// The recording sink or its retry queue failed.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// A recording operation was attempted in the wrong mode.
    #[error("no recording in progress")]
    NoRecording,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a connection failure.
    pub fn connection_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a GATT setup failure.
    pub fn gatt_setup(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GattSetupFailed {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a device-unavailable error.
    pub fn unavailable(address: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            address: address.into(),
        }
    }

    /// Create a sync failure.
    pub fn sync_failed(device: DeviceId, message: impl Into<String>) -> Self {
        Self::SyncFailed {
            device,
            message: message.into(),
        }
    }

    /// Create a command timeout.
    pub fn command_timeout(command: &'static str, duration: Duration) -> Self {
        Self::CommandTimeout { command, duration }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias using flexrig-core's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::unavailable("aa:bb:cc:dd:ee:ff");
        assert!(err.to_string().contains("aa:bb:cc:dd:ee:ff"));

        let err = Error::InvalidTransition {
            device: DeviceId::LeftThigh,
            from: DeviceState::Discovered,
            to: DeviceState::Streaming,
        };
        assert!(err.to_string().contains("discovered -> streaming"));

        let err = Error::command_timeout("GET_STATE", Duration::from_millis(100));
        assert!(err.to_string().contains("GET_STATE"));

        let err = Error::NotReadyForStreaming {
            device: DeviceId::RightShin,
            state: FirmwareState::TxDirect,
        };
        assert!(err.to_string().contains("TxDirect"));
    }

    #[test]
    fn test_parse_error_conversion() {
        let parse = ParseError::insufficient(16, 4);
        let err: Error = parse.into();
        assert!(matches!(err, Error::InvalidPacket(_)));
        assert!(err.to_string().contains("expected 16"));
    }
}
