//! Packet codec for the Puck wire protocol.
//!
//! Commands travel central → peripheral on the RX characteristic as
//! `[command, args...]`. Telemetry travels peripheral → central on the TX
//! characteristic as `[type, payload...]`. Every field is a single byte, so
//! byte order never comes up. If a multi-byte field is ever added it must be
//! little-endian, matching the peripheral's MCU, and read with
//! [`bytes::Buf::get_u16_le`] and friends.

use crate::error::{PuckError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Maximum length of a single characteristic write or notification
pub const MAX_WRITE_LEN: usize = 20;

/// Handshake response code: station token accepted
pub const HANDSHAKE_OK: u8 = 1;

/// Handshake response code: peripheral belongs to another station
pub const HANDSHAKE_MISMATCH: u8 = 2;

/// Commands the central can send
///
/// The numbering is part of the wire contract and never changes between
/// firmware revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    /// Present the station token
    Handshake = 0x01,
    /// Start counting (Armed → Active)
    StartSession = 0x02,
    /// Stop counting (Active → Stopped)
    StopSession = 0x03,
    /// Collect a new baseline (Idle → Calibrating)
    Calibrate = 0x04,
    /// Zero the counter and return to Idle
    Reset = 0x05,
}

impl TryFrom<u8> for CommandId {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::StartSession),
            0x03 => Ok(Self::StopSession),
            0x04 => Ok(Self::Calibrate),
            0x05 => Ok(Self::Reset),
            other => Err(other),
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake => write!(f, "HANDSHAKE"),
            Self::StartSession => write!(f, "START_SESSION"),
            Self::StopSession => write!(f, "STOP_SESSION"),
            Self::Calibrate => write!(f, "CALIBRATE"),
            Self::Reset => write!(f, "RESET"),
        }
    }
}

/// Telemetry packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Cumulative repetition count
    RepCount = 0x01,
    /// Sent once the central is authenticated and subscribed
    HandshakeAck = 0x02,
    /// Full session snapshot
    Status = 0x03,
    /// Periodic liveness packet
    Heartbeat = 0x04,
    /// Peripheral-side error code
    Error = 0x05,
}

impl PacketType {
    /// Minimum payload length the type requires
    #[must_use]
    pub const fn min_payload_len(self) -> usize {
        match self {
            PacketType::Status => 4,
            PacketType::RepCount
            | PacketType::HandshakeAck
            | PacketType::Heartbeat
            | PacketType::Error => 1,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PuckError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::RepCount),
            0x02 => Ok(Self::HandshakeAck),
            0x03 => Ok(Self::Status),
            0x04 => Ok(Self::Heartbeat),
            0x05 => Ok(PacketType::Error),
            other => Err(PuckError::UnknownPacketType(other)),
        }
    }
}

/// Error codes carried by ERROR packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Command arrived before the handshake succeeded
    NotAuthenticated,
    /// Command not valid in the current session state
    InvalidState,
    /// First byte is not a known command
    UnknownCommand,
    /// Session cannot start without a baseline
    NotCalibrated,
    /// Command had the wrong shape
    MalformedCommand,
    /// Code this client does not know
    Other(u8),
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::NotAuthenticated,
            2 => Self::InvalidState,
            3 => Self::UnknownCommand,
            4 => Self::NotCalibrated,
            5 => Self::MalformedCommand,
            other => Self::Other(other),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NotAuthenticated => 1,
            ErrorCode::InvalidState => 2,
            ErrorCode::UnknownCommand => 3,
            ErrorCode::NotCalibrated => 4,
            ErrorCode::MalformedCommand => 5,
            ErrorCode::Other(other) => other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthenticated => write!(f, "Not Authenticated"),
            Self::InvalidState => write!(f, "Invalid State"),
            Self::UnknownCommand => write!(f, "Unknown Command"),
            Self::NotCalibrated => write!(f, "Not Calibrated"),
            Self::MalformedCommand => write!(f, "Malformed Command"),
            Self::Other(code) => write!(f, "Error {code:#04X}"),
        }
    }
}

/// A raw telemetry packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Type discriminant
    pub packet_type: u8,
    /// Type-specific payload
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet of a known type
    #[must_use]
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type: packet_type as u8,
            payload: payload.into(),
        }
    }

    /// `REP_COUNT` packet
    #[must_use]
    pub fn rep_count(count: u8) -> Self {
        Self::new(PacketType::RepCount, vec![count])
    }

    /// `HANDSHAKE_ACK` packet
    #[must_use]
    pub fn handshake_ack(count: u8) -> Self {
        Self::new(PacketType::HandshakeAck, vec![count])
    }

    /// `STATUS` packet
    #[must_use]
    pub fn status(active: bool, count: u8, battery_pct: u8, calibrated: bool) -> Self {
        Self::new(
            PacketType::Status,
            vec![u8::from(active), count, battery_pct, u8::from(calibrated)],
        )
    }

    /// `HEARTBEAT` packet
    #[must_use]
    pub fn heartbeat(battery_pct: u8) -> Self {
        Self::new(PacketType::Heartbeat, vec![battery_pct])
    }

    /// `ERROR` packet
    #[must_use]
    pub fn error(code: ErrorCode) -> Self {
        Self::new(PacketType::Error, vec![u8::from(code)])
    }

    /// Known type of this packet
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::UnknownPacketType`] for unrecognised type bytes.
    pub fn kind(&self) -> Result<PacketType> {
        PacketType::try_from(self.packet_type)
    }

    /// Serialize packet to bytes
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::PayloadTooLarge`] if the packet does not fit one notification.
    pub fn to_bytes(&self) -> Result<Bytes> {
        encode_packet(self.packet_type, &self.payload)
    }
}

fn encode_frame(head: u8, body: &[u8]) -> Result<Bytes> {
    let len = body.len() + 1;
    if len > MAX_WRITE_LEN {
        return Err(PuckError::PayloadTooLarge {
            len,
            max: MAX_WRITE_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(len);
    buf.put_u8(head);
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}

/// Encode a command write: `[command_id, ...args]`
///
/// # Errors
///
/// Returns [`PuckError::PayloadTooLarge`] if the write would exceed
/// [`MAX_WRITE_LEN`]. Oversized commands are never clipped.
pub fn encode_command(command_id: u8, args: &[u8]) -> Result<Bytes> {
    encode_frame(command_id, args)
}

/// Encode a telemetry notification: `[packet_type, ...payload]`
///
/// # Errors
///
/// Returns [`PuckError::PayloadTooLarge`] if the notification would exceed
/// [`MAX_WRITE_LEN`].
pub fn encode_packet(packet_type: u8, payload: &[u8]) -> Result<Bytes> {
    encode_frame(packet_type, payload)
}

/// Split a notification into type and payload
///
/// The type byte is not validated here; see [`Packet::kind`].
///
/// # Errors
///
/// Returns [`PuckError::MalformedPacket`] if the buffer is empty.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet> {
    let (&packet_type, payload) = bytes
        .split_first()
        .ok_or_else(|| PuckError::MalformedPacket("empty packet".to_string()))?;

    Ok(Packet {
        packet_type,
        payload: Bytes::copy_from_slice(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization() {
        let bytes = encode_command(CommandId::StartSession as u8, &[]).unwrap();
        assert_eq!(&bytes[..], &[0x02]);

        let bytes = encode_command(CommandId::Handshake as u8, b"LEGEXT01").unwrap();
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[1..], b"LEGEXT01");
    }

    #[test]
    fn test_command_length_ceiling() {
        assert!(encode_command(0x02, &[0; MAX_WRITE_LEN - 1]).is_ok());

        let err = encode_command(0x02, &[0; MAX_WRITE_LEN]).unwrap_err();
        assert!(matches!(
            err,
            PuckError::PayloadTooLarge {
                len: 21,
                max: MAX_WRITE_LEN
            }
        ));
    }

    #[test]
    fn test_packet_deserialization() {
        let packet = decode_packet(&[0x01, 0x05]).unwrap();
        assert_eq!(packet.packet_type, 0x01);
        assert_eq!(&packet.payload[..], &[0x05]);
        assert_eq!(packet.kind().unwrap(), PacketType::RepCount);

        let bare = decode_packet(&[0x04]).unwrap();
        assert!(bare.payload.is_empty());
    }

    #[test]
    fn test_empty_packet_is_malformed() {
        assert!(matches!(
            decode_packet(&[]),
            Err(PuckError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_packet_roundtrip_for_each_type() {
        let packets = [
            Packet::rep_count(12),
            Packet::handshake_ack(3),
            Packet::status(true, 7, 88, true),
            Packet::heartbeat(64),
            Packet::error(ErrorCode::InvalidState),
        ];

        for packet in packets {
            let bytes = packet.to_bytes().unwrap();
            assert_eq!(decode_packet(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn test_unknown_packet_type() {
        let packet = decode_packet(&[0x7E, 0x01]).unwrap();
        assert!(matches!(packet.kind(), Err(PuckError::UnknownPacketType(0x7E))));
    }

    #[test]
    fn test_command_id_values_are_stable() {
        assert_eq!(CommandId::Handshake as u8, 1);
        assert_eq!(CommandId::StartSession as u8, 2);
        assert_eq!(CommandId::StopSession as u8, 3);
        assert_eq!(CommandId::Calibrate as u8, 4);
        assert_eq!(CommandId::Reset as u8, 5);
        assert_eq!(CommandId::try_from(0x04), Ok(CommandId::Calibrate));
        assert_eq!(CommandId::try_from(0x09), Err(0x09));
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ErrorCode::from(2), ErrorCode::InvalidState);
        assert_eq!(ErrorCode::from(0xEE), ErrorCode::Other(0xEE));
        assert_eq!(u8::from(ErrorCode::NotCalibrated), 4);
    }
}
