use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, time::Duration};
use uuid::Uuid;

use crate::{
    error::{PuckError, Result},
    PUCK_RX_CHAR_UUID, PUCK_SERVICE_UUID, PUCK_TX_CHAR_UUID,
};

/// Length of a station token in bytes
pub const STATION_ID_LEN: usize = 8;

/// Default number of samples averaged into the calibration baseline
pub const DEFAULT_CALIBRATION_SAMPLES: usize = 20;

/// Default minimum spacing between two counted repetitions
pub const DEFAULT_COOLDOWN_MS: u64 = 500;

/// Default time after which an unattended active session stops itself
pub const DEFAULT_AUTO_STOP_TIMEOUT_MS: u64 = 30_000;

/// Default number of pairing attempts before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default fixed delay between pairing attempts
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;

/// Identity of a physical training station
///
/// Always exactly [`STATION_ID_LEN`] ASCII bytes. The same bytes appear on the
/// station's NFC tag, in the Puck's advertisement and in the handshake write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StationId([u8; STATION_ID_LEN]);

impl StationId {
    /// Create a station id from its textual token
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::InvalidStationId`] if the token is not exactly
    /// eight ASCII characters.
    pub fn new(token: &str) -> Result<Self> {
        Self::from_bytes(token.as_bytes())
    }

    /// Create a station id from raw bytes
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::InvalidStationId`] if the slice is not exactly
    /// eight ASCII bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let token: [u8; STATION_ID_LEN] = bytes.try_into().map_err(|_| {
            PuckError::InvalidStationId(format!(
                "expected {STATION_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;

        if !token.is_ascii() {
            return Err(PuckError::InvalidStationId(format!(
                "token {token:02X?} is not ASCII"
            )));
        }

        Ok(Self(token))
    }

    /// Raw token bytes as written on the wire
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; STATION_ID_LEN] {
        &self.0
    }

    /// Token as text
    #[must_use]
    pub fn as_str(&self) -> &str {
        // validated ASCII on construction
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for StationId {
    type Error = PuckError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<StationId> for String {
    fn from(value: StationId) -> Self {
        value.as_str().to_string()
    }
}

/// Platform identifier of a peripheral (address or opaque id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a platform identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One scan result, discarded after the filtering decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementRecord {
    /// Peripheral that sent the advertisement
    pub device_id: DeviceId,
    /// Manufacturer data keyed by manufacturer ID
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Advertised local name
    pub local_name: Option<String>,
    /// Signal strength
    pub rssi: Option<i16>,
}

impl AdvertisementRecord {
    /// Create an empty record for a device
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            manufacturer_data: HashMap::new(),
            local_name: None,
            rssi: None,
        }
    }

    /// Add a manufacturer data entry
    #[must_use]
    pub fn with_manufacturer_data(mut self, manufacturer_id: u16, payload: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data.insert(manufacturer_id, payload.into());
        self
    }

    /// Set the advertised name
    #[must_use]
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Set the signal strength
    #[must_use]
    pub const fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

/// Peripheral session state
///
/// Owned by the Puck. The central only ever holds a projection of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Not calibrated, waiting for a calibrate request
    Idle,
    /// Collecting baseline samples
    Calibrating,
    /// Calibrated and ready to start
    Armed,
    /// Counting repetitions
    Active,
    /// Session ended, count retained until reset
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Calibrating => write!(f, "Calibrating"),
            Self::Armed => write!(f, "Armed"),
            Self::Active => write!(f, "Active"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Central-side connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing in progress
    Idle,
    /// Looking for the station's advertisement
    Scanning,
    /// Establishing the link
    Connecting,
    /// Exchanging the station token
    Handshaking,
    /// Authenticated and subscribed, no telemetry yet
    Subscribed,
    /// Telemetry is flowing
    Streaming,
    /// Waiting before the given attempt
    Retrying {
        /// Attempt about to start (1-based)
        attempt: u32,
    },
    /// Link closed or lost
    Disconnected,
}

impl ConnectionState {
    /// Check if a usable authenticated link exists
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Subscribed | Self::Streaming)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Retrying { attempt } => write!(f, "Retrying (attempt {attempt})"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// GATT layout a Puck deployment exposes
///
/// Pick one profile per deployment and pass it through [`ConnectionParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    /// Primary service
    pub service: Uuid,
    /// Writable handshake/command characteristic
    pub rx: Uuid,
    /// Notifying telemetry characteristic
    pub tx: Uuid,
}

impl GattProfile {
    /// Nordic UART style layout used by current Puck firmware
    pub const NORDIC_UART: Self = Self {
        service: PUCK_SERVICE_UUID,
        rx: PUCK_RX_CHAR_UUID,
        tx: PUCK_TX_CHAR_UUID,
    };
}

impl Default for GattProfile {
    fn default() -> Self {
        Self::NORDIC_UART
    }
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Hard wall-clock scan window in milliseconds
    pub scan_window_ms: u64,
    /// Pairing attempts before giving up
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Re-pair in the background after the link is lost
    pub auto_reconnect: bool,
    /// GATT layout of the deployment
    pub profile: GattProfile,
}

impl ConnectionParams {
    /// Scan window as a [`Duration`]
    #[must_use]
    pub const fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    /// Retry delay as a [`Duration`]
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_window_ms: 10_000,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            auto_reconnect: false,
            profile: GattProfile::NORDIC_UART,
        }
    }
}

/// Per-stage timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Link establishment timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Handshake response timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Notification subscription timeout in milliseconds
    pub subscribe_timeout_ms: u64,
    /// Command write timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Silence after which the link is considered dead, in milliseconds
    pub heartbeat_timeout_ms: u64,
    /// How often the watchdog checks for silence, in milliseconds
    pub watchdog_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            subscribe_timeout_ms: 3_000,
            command_timeout_ms: 3_000,
            heartbeat_timeout_ms: 15_000,
            watchdog_interval_ms: 1_000,
        }
    }
}

/// Peripheral session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Samples averaged into the calibration baseline
    pub calibration_sample_count: usize,
    /// Minimum spacing between counted repetitions in milliseconds
    pub cooldown_ms: u64,
    /// Active session length after which the session stops itself, in milliseconds
    pub auto_stop_timeout_ms: u64,
    /// Button hold time that counts as a reset, in milliseconds
    pub long_press_ms: u64,
    /// Heartbeat period while a central is subscribed, in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Deviation from the baseline that counts as a motion event
    pub motion_threshold: f32,
}

impl SessionConfig {
    /// Cooldown as a [`Duration`]
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Auto-stop timeout as a [`Duration`]
    #[must_use]
    pub const fn auto_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.auto_stop_timeout_ms)
    }

    /// Long-press threshold as a [`Duration`]
    #[must_use]
    pub const fn long_press(&self) -> Duration {
        Duration::from_millis(self.long_press_ms)
    }

    /// Heartbeat period as a [`Duration`]
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            calibration_sample_count: DEFAULT_CALIBRATION_SAMPLES,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            auto_stop_timeout_ms: DEFAULT_AUTO_STOP_TIMEOUT_MS,
            long_press_ms: 1_500,
            heartbeat_interval_ms: 5_000,
            motion_threshold: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_id_validation() {
        let station = StationId::new("LEGEXT01").unwrap();
        assert_eq!(station.as_bytes(), b"LEGEXT01");
        assert_eq!(station.to_string(), "LEGEXT01");

        assert!(matches!(
            StationId::new("LEGEXT1"),
            Err(PuckError::InvalidStationId(_))
        ));
        assert!(StationId::new("LEGEXT012").is_err());
        assert!(StationId::from_bytes(&[0xFF; 8]).is_err());
        assert!(StationId::new("").is_err());
    }

    #[test]
    fn test_station_id_string_conversion() {
        let station = StationId::try_from("CHEST002".to_string()).unwrap();
        let text: String = station.into();
        assert_eq!(text, "CHEST002");
    }

    #[test]
    fn test_advertisement_builder() {
        let record = AdvertisementRecord::new(DeviceId::new("AA:BB:CC:DD:EE:FF"))
            .with_manufacturer_data(0x0590, b"LEGEXT01".to_vec())
            .with_local_name("Puck.js a1b2")
            .with_rssi(-61);

        assert_eq!(record.manufacturer_data.get(&0x0590).unwrap(), b"LEGEXT01");
        assert_eq!(record.local_name.as_deref(), Some("Puck.js a1b2"));
        assert_eq!(record.rssi, Some(-61));
    }

    #[test]
    fn test_connection_params_default() {
        let params = ConnectionParams::default();
        assert_eq!(params.scan_window_ms, 10_000);
        assert_eq!(params.max_attempts, 3);
        assert_eq!(params.retry_delay(), Duration::from_secs(2));
        assert!(!params.auto_reconnect);
        assert_eq!(params.profile, GattProfile::NORDIC_UART);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.calibration_sample_count, 20);
        assert_eq!(config.cooldown(), Duration::from_millis(500));
        assert_eq!(config.auto_stop_timeout(), Duration::from_secs(30));
        assert_eq!(config.long_press(), Duration::from_millis(1_500));
    }

    #[test]
    fn test_connection_state_readiness() {
        assert!(ConnectionState::Subscribed.is_ready());
        assert!(ConnectionState::Streaming.is_ready());
        assert!(!ConnectionState::Handshaking.is_ready());
        assert_eq!(
            ConnectionState::Retrying { attempt: 2 }.to_string(),
            "Retrying (attempt 2)"
        );
    }

    #[test]
    fn test_nordic_uart_uuids() {
        let profile = GattProfile::default();
        assert_eq!(
            profile.service.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(profile.rx.to_string(), "6e400002-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(profile.tx.to_string(), "6e400003-b5a3-f393-e0a9-e50e24dcca9e");
    }
}
