//! Station-token handshake.
//!
//! The central writes the 8 token bytes to the RX characteristic and the Puck
//! answers with one response byte: [`HANDSHAKE_OK`] or [`HANDSHAKE_MISMATCH`].
//! An `OK` may be followed by a second byte carrying the Puck's current rep
//! count, so reps counted while the link was down are not lost.
//!
//! Peripherals deliver the response either as a notification on RX or as the
//! value of RX read back after the write. The mode is picked from the
//! characteristic's capability flags.

use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    error::{PuckError, Result},
    link::{CharacteristicProps, GattChannel, PuckLink},
    protocol::{HANDSHAKE_MISMATCH, HANDSHAKE_OK},
    types::StationId,
};

/// Delay between read-backs while the peripheral has not answered yet
pub const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How the peripheral delivers its handshake response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Response arrives as a notification on RX
    WriteThenNotify,
    /// Response is read back from RX
    WriteThenRead,
}

impl HandshakeMode {
    /// Pick the mode from RX capability flags, preferring notifications
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::Protocol`] if RX can neither notify nor be read.
    pub fn detect(rx: CharacteristicProps) -> Result<Self> {
        if rx.notify {
            Ok(Self::WriteThenNotify)
        } else if rx.read {
            Ok(Self::WriteThenRead)
        } else {
            Err(PuckError::Protocol(
                "handshake characteristic is neither notifiable nor readable".to_string(),
            ))
        }
    }
}

/// Outcome of one handshake exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    /// Token accepted
    Authenticated {
        /// Rep count the Puck reported alongside the acceptance
        reconciled_count: Option<u8>,
    },
    /// Puck is paired with a different station
    Rejected,
    /// No response within the timeout
    TimedOut,
}

/// Bytes written to RX to present a station token
#[must_use]
pub fn handshake_request(station: &StationId) -> Bytes {
    Bytes::copy_from_slice(station.as_bytes())
}

/// Interpret a handshake response value
///
/// Returns `None` while the response is still pending: an empty value, a
/// zero byte, or a code this client does not know.
#[must_use]
pub fn interpret_response(value: &[u8]) -> Option<HandshakeResult> {
    match value.first().copied() {
        Some(HANDSHAKE_OK) => Some(HandshakeResult::Authenticated {
            reconciled_count: value.get(1).copied(),
        }),
        Some(HANDSHAKE_MISMATCH) => Some(HandshakeResult::Rejected),
        None | Some(0) => None,
        Some(code) => {
            warn!("Ignoring unknown handshake response code {code:#04X}");
            None
        }
    }
}

/// Present `expected` to the Puck and wait for its verdict
///
/// Timeouts are reported as [`HandshakeResult::TimedOut`], not as an error,
/// so the caller decides whether to retry.
///
/// # Errors
///
/// Returns [`PuckError::Protocol`] if the RX characteristic cannot deliver a
/// response, [`PuckError::WriteFailed`] if the token write is refused, or
/// [`PuckError::GattDisconnected`] if the link drops while waiting.
pub async fn perform_handshake<L>(
    link: &L,
    expected: &StationId,
    timeout: Duration,
) -> Result<HandshakeResult>
where
    L: PuckLink + ?Sized,
{
    let mode = HandshakeMode::detect(link.properties(GattChannel::Rx))?;
    info!("Handshaking with {} as station {expected} ({mode:?})", link.device_id());

    let result = tokio::time::timeout(timeout, exchange(link, expected, mode))
        .await
        .unwrap_or(Ok(HandshakeResult::TimedOut))?;

    match result {
        HandshakeResult::Authenticated { reconciled_count } => {
            info!("Station {expected} authenticated (count on peripheral: {reconciled_count:?})");
        }
        HandshakeResult::Rejected => warn!("Peripheral rejected station {expected}"),
        HandshakeResult::TimedOut => warn!("Handshake timed out after {}ms", timeout.as_millis()),
    }

    Ok(result)
}

async fn exchange<L>(link: &L, expected: &StationId, mode: HandshakeMode) -> Result<HandshakeResult>
where
    L: PuckLink + ?Sized,
{
    match mode {
        HandshakeMode::WriteThenNotify => {
            let mut notifications = link.notifications().await?;
            link.subscribe(GattChannel::Rx).await?;
            write_token(link, expected).await?;

            while let Some(notification) = notifications.next().await {
                if notification.channel != GattChannel::Rx {
                    continue;
                }
                debug!("Handshake response: {:02X?}", notification.value);
                if let Some(result) = interpret_response(&notification.value) {
                    return Ok(result);
                }
            }

            Err(PuckError::GattDisconnected)
        }
        HandshakeMode::WriteThenRead => {
            write_token(link, expected).await?;

            loop {
                let value = link.read(GattChannel::Rx).await?;
                if let Some(result) = interpret_response(&value) {
                    debug!("Handshake response: {:02X?}", value);
                    return Ok(result);
                }
                tokio::time::sleep(HANDSHAKE_POLL_INTERVAL).await;
            }
        }
    }
}

async fn write_token<L>(link: &L, station: &StationId) -> Result<()>
where
    L: PuckLink + ?Sized,
{
    let request = handshake_request(station);
    debug!("Sending handshake: {:02X?}", &request[..]);
    link.write(GattChannel::Rx, &request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        link::PuckCentral,
        simulated::{PeripheralBehavior, SimulatedCentral, SimulatedPuck},
        types::SessionConfig,
    };

    async fn connect(puck: &SimulatedPuck) -> crate::simulated::SimulatedLink {
        let central = SimulatedCentral::new(vec![puck.clone()]);
        central.connect(puck.device_id()).await.unwrap()
    }

    fn station(token: &str) -> StationId {
        StationId::new(token).unwrap()
    }

    #[test]
    fn test_mode_detection() {
        let notify = CharacteristicProps {
            write: true,
            notify: true,
            read: true,
        };
        assert_eq!(
            HandshakeMode::detect(notify).unwrap(),
            HandshakeMode::WriteThenNotify
        );

        let read_only = CharacteristicProps {
            write: true,
            read: true,
            notify: false,
        };
        assert_eq!(
            HandshakeMode::detect(read_only).unwrap(),
            HandshakeMode::WriteThenRead
        );

        assert!(HandshakeMode::detect(CharacteristicProps::default()).is_err());
    }

    #[test]
    fn test_interpret_response() {
        assert_eq!(
            interpret_response(&[1]),
            Some(HandshakeResult::Authenticated {
                reconciled_count: None
            })
        );
        assert_eq!(
            interpret_response(&[1, 9]),
            Some(HandshakeResult::Authenticated {
                reconciled_count: Some(9)
            })
        );
        assert_eq!(interpret_response(&[2]), Some(HandshakeResult::Rejected));
        assert_eq!(interpret_response(&[]), None);
        assert_eq!(interpret_response(&[0]), None);
        assert_eq!(interpret_response(&[0x42]), None);
    }

    #[test]
    fn test_request_is_raw_token() {
        assert_eq!(&handshake_request(&station("LEGEXT01"))[..], b"LEGEXT01");
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_token_authenticates() {
        for behavior in [PeripheralBehavior::notify(), PeripheralBehavior::read_back()] {
            let puck = SimulatedPuck::new(station("LEGEXT01"), SessionConfig::default())
                .with_behavior(behavior);
            let link = connect(&puck).await;

            let result = perform_handshake(&link, &station("LEGEXT01"), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(
                result,
                HandshakeResult::Authenticated {
                    reconciled_count: Some(0)
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_token_is_rejected() {
        for behavior in [PeripheralBehavior::notify(), PeripheralBehavior::read_back()] {
            let puck = SimulatedPuck::new(station("LEGEXT01"), SessionConfig::default())
                .with_behavior(behavior);
            let link = connect(&puck).await;

            let result = perform_handshake(&link, &station("CHEST002"), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(result, HandshakeResult::Rejected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peripheral_times_out() {
        for behavior in [PeripheralBehavior::notify(), PeripheralBehavior::read_back()] {
            let puck = SimulatedPuck::new(station("LEGEXT01"), SessionConfig::default())
                .with_behavior(behavior.silent());
            let link = connect(&puck).await;

            let started = tokio::time::Instant::now();
            let result = perform_handshake(&link, &station("LEGEXT01"), Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(result, HandshakeResult::TimedOut);
            assert!(started.elapsed() >= Duration::from_secs(2));
        }
    }
}
