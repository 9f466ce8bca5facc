use thiserror::Error;

/// Errors raised by the pure FTMS codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload ended before every field announced by the flags was read
    #[error("Truncated payload: needed {needed} bytes, got {actual}")]
    TruncatedPayload {
        /// Bytes required by the flags read so far
        needed: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Status snapshots must carry at least one byte
    #[error("Empty payload")]
    EmptyPayload,

    /// Control point opcode outside the supported treadmill subset
    #[error("Unknown control point opcode: {0:02X}")]
    UnknownOpCode(u8),

    /// Parameter byte outside its defined range
    #[error("Invalid parameter for opcode {opcode:02X}: {value:02X}")]
    InvalidParameter {
        /// Opcode the parameter belongs to
        opcode: u8,
        /// Offending parameter value
        value: u8,
    },
}

/// Errors that can occur while bridging a treadmill
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bluetooth Low Energy central errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// BlueZ peripheral errors
    #[cfg(all(target_os = "linux", feature = "companion"))]
    #[error("BlueZ error: {0}")]
    Bluez(#[from] bluer::Error),

    /// Malformed FTMS payload
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// No device advertising FTMS was found before the discovery timeout
    #[error("No FTMS device found within {timeout_ms}ms")]
    DiscoveryTimeout {
        /// Discovery window in milliseconds
        timeout_ms: u64,
    },

    /// Connected device does not expose the Fitness Machine Service
    #[error("FTMS service not found on {0}")]
    ServiceNotFound(String),

    /// A required FTMS characteristic is missing
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    /// The radio dropped the link without being asked to
    #[error("Device disconnected unexpectedly")]
    UnsolicitedDisconnect,

    /// ANT+ channel transmit queue overflowed
    #[error("ANT+ transmit overflow")]
    TransmitOverflow,

    /// Control point write failed
    #[error("Control point write rejected: {0}")]
    WriteRejected(String),

    /// Requested radio adapter is not present
    #[error("Bluetooth adapter not found: {0}")]
    AdapterNotFound(String),

    /// Companion peripheral failure
    #[error("Companion error: {0}")]
    Companion(String),

    /// ANT+ stick or channel failure
    #[error("ANT+ error: {0}")]
    Ant(String),

    /// ANT+ command not acknowledged in time
    #[error("ANT+ command {message_id:02X} timed out after {timeout_ms}ms")]
    AntTimeout {
        /// Message id of the unacknowledged command
        message_id: u8,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Link is not in a state that accepts the operation
    #[error("Link not ready: {reason}")]
    NotReady {
        /// Reason why the link is not ready
        reason: String,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::DiscoveryTimeout { .. }
                | Self::ServiceNotFound(_)
                | Self::CharacteristicNotFound(_)
                | Self::UnsolicitedDisconnect
                | Self::AdapterNotFound(_)
        )
    }

    /// Check if this error is recoverable by retrying the same operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DiscoveryTimeout { .. }
                | Self::UnsolicitedDisconnect
                | Self::TransmitOverflow
                | Self::AntTimeout { .. }
                | Self::Codec(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = BridgeError::DiscoveryTimeout { timeout_ms: 5000 };
        assert!(timeout.is_connection_error());
        assert!(timeout.is_recoverable());

        let missing = BridgeError::ServiceNotFound("AA:BB:CC:DD:EE:FF".to_string());
        assert!(missing.is_connection_error());
        assert!(!missing.is_recoverable());

        let overflow = BridgeError::TransmitOverflow;
        assert!(!overflow.is_connection_error());
        assert!(overflow.is_recoverable());

        let rejected = BridgeError::WriteRejected("gatt error".to_string());
        assert!(!rejected.is_connection_error());
        assert!(!rejected.is_recoverable());
    }

    #[test]
    fn test_codec_error_conversion() {
        let error: BridgeError = CodecError::TruncatedPayload { needed: 5, actual: 3 }.into();
        let error_string = format!("{error}");
        assert!(error_string.contains("Codec error"));
        assert!(error_string.contains("needed 5"));
        assert!(error.is_recoverable());
    }
}
