use thiserror::Error;

/// Errors that can occur while pairing with or streaming from a Puck station
#[derive(Error, Debug)]
pub enum PuckError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The scan window elapsed without a matching advertisement
    #[error("No matching station advertisement within {window_ms}ms")]
    ScanTimeout {
        /// Scan window in milliseconds
        window_ms: u64,
    },

    /// Device or adapter not found
    #[error("Puck device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// The GATT server dropped the link
    #[error("GATT server disconnected")]
    GattDisconnected,

    /// The peripheral did not answer the handshake in time
    #[error("Handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The peripheral is paired with a different station
    #[error("Handshake rejected: peripheral is not paired with station {station}")]
    HandshakeRejected {
        /// Station token the central presented
        station: String,
    },

    /// Packet could not be decoded
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Packet carried a type byte this client does not know
    #[error("Unknown packet type: {0:#04X}")]
    UnknownPacketType(u8),

    /// A write to the peripheral failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Encoded buffer would exceed the characteristic write ceiling
    #[error("Payload of {len} bytes exceeds the {max}-byte characteristic limit")]
    PayloadTooLarge {
        /// Requested length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Station token is not 8 ASCII bytes
    #[error("Invalid station id: {0}")]
    InvalidStationId(String),

    /// A scan is already running on this client
    #[error("Already scanning")]
    AlreadyScanning,

    /// The client is not in a state that accepts the request
    #[error("Not ready: {reason}")]
    NotReady {
        /// Reason why the client is not ready
        reason: String,
    },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Every attempt failed with a transient error
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error of the final attempt
        last: Box<PuckError>,
    },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for Puck operations
pub type Result<T> = std::result::Result<T, PuckError>;

impl PuckError {
    /// Check if this error may clear up on its own and is worth another attempt
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ScanTimeout { .. }
                | Self::DeviceNotFound
                | Self::ConnectionFailed(_)
                | Self::GattDisconnected
                | Self::HandshakeTimeout { .. }
                | Self::Ble(
                    btleplug::Error::NotConnected
                        | btleplug::Error::DeviceNotFound
                        | btleplug::Error::TimedOut(_)
                )
        )
    }

    /// Check if this error means the peripheral belongs to another station
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::HandshakeRejected { .. })
    }

    /// Check if this error only affects a single packet
    #[must_use]
    pub const fn is_packet_error(&self) -> bool {
        matches!(self, Self::MalformedPacket(_) | Self::UnknownPacketType(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = PuckError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_transient());
        assert!(!connection_error.is_rejection());
        assert!(!connection_error.is_packet_error());

        let timeout_error = PuckError::HandshakeTimeout { timeout_ms: 5000 };
        assert!(timeout_error.is_transient());

        let rejected = PuckError::HandshakeRejected {
            station: "LEGEXT01".to_string(),
        };
        assert!(!rejected.is_transient());
        assert!(rejected.is_rejection());

        assert!(!PuckError::Cancelled.is_transient());
        assert!(!PuckError::WriteFailed("busy".to_string()).is_transient());
        assert!(PuckError::UnknownPacketType(0x7F).is_packet_error());
        assert!(PuckError::MalformedPacket("empty".to_string()).is_packet_error());
    }

    #[test]
    fn test_dropped_ble_link_is_transient() {
        assert!(PuckError::from(btleplug::Error::NotConnected).is_transient());
        assert!(PuckError::from(btleplug::Error::DeviceNotFound).is_transient());
        assert!(PuckError::from(btleplug::Error::TimedOut(std::time::Duration::from_secs(1)))
            .is_transient());

        assert!(!PuckError::from(btleplug::Error::PermissionDenied).is_transient());
        assert!(!PuckError::from(btleplug::Error::NotSupported("indicate".to_string()))
            .is_transient());
    }

    #[test]
    fn test_error_display() {
        let error = PuckError::PayloadTooLarge { len: 21, max: 20 };
        let error_string = format!("{error}");
        assert!(error_string.contains("21 bytes"));
        assert!(error_string.contains("20-byte"));

        let exhausted = PuckError::RetriesExhausted {
            attempts: 3,
            last: Box::new(PuckError::GattDisconnected),
        };
        assert!(format!("{exhausted}").contains("3 attempts"));
        assert_eq!(format!("{}", PuckError::UnknownPacketType(0x7F)), "Unknown packet type: 0x7F");
    }
}
