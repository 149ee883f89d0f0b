//! Central-side telemetry decoding and the session mirror.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::{
    error::{PuckError, Result},
    protocol::{decode_packet, ErrorCode, PacketType},
    types::SessionState,
};

/// Contents of a `STATUS` packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// A session is counting
    pub active: bool,
    /// Cumulative repetition count
    pub count: u8,
    /// Battery level in percent
    pub battery_pct: u8,
    /// A baseline is in place
    pub calibrated: bool,
}

/// Decoded telemetry notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// New cumulative count
    RepCount {
        /// Cumulative count, not an increment
        count: u8,
    },
    /// Peripheral confirmed the authenticated, subscribed link
    HandshakeAck {
        /// Count at the time of the acknowledgement
        count: u8,
    },
    /// Full session snapshot
    Status(StatusSnapshot),
    /// Liveness ping
    Heartbeat {
        /// Battery level in percent
        battery_pct: u8,
    },
    /// Peripheral reported an error
    Error {
        /// Reported code
        code: ErrorCode,
    },
}

/// Decode one TX notification
///
/// Payload bytes beyond what the type needs are ignored so newer firmware can
/// append fields.
///
/// # Errors
///
/// Returns [`PuckError::MalformedPacket`] for an empty buffer or a payload
/// shorter than the type requires, and [`PuckError::UnknownPacketType`] for an
/// unknown type byte.
pub fn decode_telemetry(bytes: &[u8]) -> Result<TelemetryEvent> {
    let packet = decode_packet(bytes)?;
    let kind = packet.kind()?;
    let payload = &packet.payload[..];

    if payload.len() < kind.min_payload_len() {
        return Err(PuckError::MalformedPacket(format!(
            "{kind:?} needs {} payload bytes, got {}",
            kind.min_payload_len(),
            payload.len()
        )));
    }

    let event = match kind {
        PacketType::RepCount => TelemetryEvent::RepCount { count: payload[0] },
        PacketType::HandshakeAck => TelemetryEvent::HandshakeAck { count: payload[0] },
        PacketType::Status => TelemetryEvent::Status(StatusSnapshot {
            active: payload[0] != 0,
            count: payload[1],
            battery_pct: payload[2],
            calibrated: payload[3] != 0,
        }),
        PacketType::Heartbeat => TelemetryEvent::Heartbeat {
            battery_pct: payload[0],
        },
        PacketType::Error => TelemetryEvent::Error {
            code: ErrorCode::from(payload[0]),
        },
    };

    Ok(event)
}

/// Central's read-only copy of the peripheral's session
///
/// Values are replaced, never accumulated: the peripheral always sends
/// cumulative figures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMirror {
    /// Projected session state
    pub state: SessionState,
    /// Last reported count
    pub count: u8,
    /// Last reported battery level
    pub battery_pct: Option<u8>,
    /// Last reported calibration flag
    pub calibrated: bool,
    /// Last error the peripheral reported
    pub last_error: Option<ErrorCode>,
}

impl Default for SessionMirror {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            count: 0,
            battery_pct: None,
            calibrated: false,
            last_error: None,
        }
    }
}

impl SessionMirror {
    /// Fold one event into the mirror
    pub fn apply(&mut self, event: &TelemetryEvent) {
        match *event {
            TelemetryEvent::RepCount { count } | TelemetryEvent::HandshakeAck { count } => {
                self.count = count;
            }
            TelemetryEvent::Status(status) => {
                self.count = status.count;
                self.battery_pct = Some(status.battery_pct);
                self.calibrated = status.calibrated;
                self.state = project_state(self.state, status);
            }
            TelemetryEvent::Heartbeat { battery_pct } => self.battery_pct = Some(battery_pct),
            TelemetryEvent::Error { code } => self.last_error = Some(code),
        }
    }
}

/// STATUS does not carry the state itself, so it is inferred from the flags
/// and the previous projection.
fn project_state(previous: SessionState, status: StatusSnapshot) -> SessionState {
    if status.active {
        SessionState::Active
    } else if !status.calibrated {
        SessionState::Idle
    } else if matches!(previous, SessionState::Active | SessionState::Stopped) {
        SessionState::Stopped
    } else {
        SessionState::Armed
    }
}

/// Decoding pipeline for the TX notification stream
///
/// Bad packets are logged and dropped; one corrupt notification never ends
/// the stream.
#[derive(Debug, Default)]
pub struct TelemetryStream {
    mirror: SessionMirror,
    last_packet_at: Option<Instant>,
    dropped: u64,
}

impl TelemetryStream {
    /// Create an empty stream
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a notification and fold it into the mirror
    pub fn process(&mut self, bytes: &[u8], now: Instant) -> Option<TelemetryEvent> {
        self.last_packet_at = Some(now);

        match decode_telemetry(bytes) {
            Ok(event) => {
                trace!("Telemetry: {event:?}");
                self.mirror.apply(&event);
                if let TelemetryEvent::Error { code } = event {
                    warn!("Puck reported error: {code}");
                }
                Some(event)
            }
            Err(e) => {
                self.dropped += 1;
                warn!("Dropping packet {:02X?}: {e}", bytes);
                None
            }
        }
    }

    /// Check if nothing arrived for at least `timeout`
    ///
    /// A stream that never received anything counts from `since`.
    #[must_use]
    pub fn is_silent(&self, since: Instant, now: Instant, timeout: Duration) -> bool {
        let last = self.last_packet_at.map_or(since, |last| last.max(since));
        now.saturating_duration_since(last) >= timeout
    }

    /// Take the count a handshake response reported
    ///
    /// Lets the mirror show the peripheral's count before the first
    /// notification arrives.
    pub fn reconcile(&mut self, count: u8) {
        self.mirror.count = count;
    }

    /// Current mirror
    #[must_use]
    pub const fn mirror(&self) -> &SessionMirror {
        &self.mirror
    }

    /// Number of packets dropped as malformed or unknown
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Forget everything, for a new pairing
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_each_type() {
        assert_eq!(
            decode_telemetry(&[0x01, 0x05]).unwrap(),
            TelemetryEvent::RepCount { count: 5 }
        );
        assert_eq!(
            decode_telemetry(&[0x02, 0x03]).unwrap(),
            TelemetryEvent::HandshakeAck { count: 3 }
        );
        assert_eq!(
            decode_telemetry(&[0x03, 1, 12, 80, 1]).unwrap(),
            TelemetryEvent::Status(StatusSnapshot {
                active: true,
                count: 12,
                battery_pct: 80,
                calibrated: true,
            })
        );
        assert_eq!(
            decode_telemetry(&[0x04, 64]).unwrap(),
            TelemetryEvent::Heartbeat { battery_pct: 64 }
        );
        assert_eq!(
            decode_telemetry(&[0x05, 0x04]).unwrap(),
            TelemetryEvent::Error {
                code: ErrorCode::NotCalibrated
            }
        );
    }

    #[test]
    fn test_short_and_unknown_packets() {
        assert!(matches!(
            decode_telemetry(&[]),
            Err(PuckError::MalformedPacket(_))
        ));
        assert!(matches!(
            decode_telemetry(&[0x01]),
            Err(PuckError::MalformedPacket(_))
        ));
        assert!(matches!(
            decode_telemetry(&[0x03, 1, 2]),
            Err(PuckError::MalformedPacket(_))
        ));
        assert!(matches!(
            decode_telemetry(&[0x7F, 1]),
            Err(PuckError::UnknownPacketType(0x7F))
        ));
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        assert_eq!(
            decode_telemetry(&[0x01, 0x05, 0xAA, 0xBB]).unwrap(),
            TelemetryEvent::RepCount { count: 5 }
        );
    }

    #[test]
    fn test_status_replaces_count() {
        let mut stream = TelemetryStream::new();
        let now = Instant::now();

        stream.process(&[0x03, 1, 3, 90, 1], now);
        stream.process(&[0x03, 1, 7, 90, 1], now);
        assert_eq!(stream.mirror().count, 7);
        assert_eq!(stream.mirror().state, SessionState::Active);
    }

    #[test]
    fn test_unknown_packet_is_dropped_without_side_effects() {
        let mut stream = TelemetryStream::new();
        let now = Instant::now();
        stream.process(&[0x01, 4], now);

        assert_eq!(stream.process(&[0x42, 9, 9], now), None);
        assert_eq!(stream.dropped(), 1);
        assert_eq!(stream.mirror().count, 4);

        assert_eq!(
            stream.process(&[0x01, 5], now),
            Some(TelemetryEvent::RepCount { count: 5 })
        );
    }

    #[test]
    fn test_reconciled_count_is_replaced_by_telemetry() {
        let mut stream = TelemetryStream::new();
        stream.reconcile(6);
        assert_eq!(stream.mirror().count, 6);

        stream.process(&[0x01, 7], Instant::now());
        assert_eq!(stream.mirror().count, 7);
    }

    #[test]
    fn test_state_projection() {
        let mut mirror = SessionMirror::default();
        let status = |active, calibrated| {
            TelemetryEvent::Status(StatusSnapshot {
                active,
                count: 0,
                battery_pct: 100,
                calibrated,
            })
        };

        mirror.apply(&status(false, false));
        assert_eq!(mirror.state, SessionState::Idle);
        mirror.apply(&status(false, true));
        assert_eq!(mirror.state, SessionState::Armed);
        mirror.apply(&status(true, true));
        assert_eq!(mirror.state, SessionState::Active);
        mirror.apply(&status(false, true));
        assert_eq!(mirror.state, SessionState::Stopped);
        mirror.apply(&status(false, false));
        assert_eq!(mirror.state, SessionState::Idle);
    }

    #[test]
    fn test_silence_detection() {
        let mut stream = TelemetryStream::new();
        let t0 = Instant::now();
        let timeout = Duration::from_secs(15);

        assert!(!stream.is_silent(t0, t0 + Duration::from_secs(14), timeout));
        assert!(stream.is_silent(t0, t0 + Duration::from_secs(15), timeout));

        stream.process(&[0x04, 90], t0 + Duration::from_secs(10));
        assert!(!stream.is_silent(t0, t0 + Duration::from_secs(20), timeout));
        assert!(stream.is_silent(t0, t0 + Duration::from_secs(25), timeout));
    }
}
