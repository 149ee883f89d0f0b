#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Pucklink
//!
//! Central-side client for Puck rep-counting stations over Bluetooth Low Energy.
//!
//! A Puck is a small wearable sensor that counts repetitions at a training
//! station. Each station carries an 8-byte ASCII token (for example
//! `LEGEXT01`) that is written to an NFC tag and advertised by the Puck in its
//! manufacturer data. This crate implements the app side of the link:
//!
//! - **Advertisement filtering**: only connect to the Puck advertising the expected station token
//! - **Handshake**: write the token, accept `OK` (1) or surface `MISMATCH` (2)
//! - **Telemetry**: decode rep counts, status snapshots, heartbeats and errors in arrival order
//! - **Orchestration**: scan → connect → handshake → subscribe with timeouts, retries and cleanup
//!
//! The peripheral-side session state machine is implemented too
//! ([`session::PuckSession`]); it drives the in-process simulated Puck in
//! [`simulated`], which lets the whole protocol run without a radio.
//!
//! ## Wire Format
//!
//! Every value on the wire is a single byte. Commands are `[command, args...]`
//! written to the RX characteristic, telemetry is `[type, payload...]` notified
//! on the TX characteristic. Both are capped at [`protocol::MAX_WRITE_LEN`] bytes.
//! Rep counts are one byte and wrap after 255.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pucklink::{ConnectionParams, PuckDevice, StationId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let station = StationId::new("LEGEXT01")?;
//!     let device = PuckDevice::with_ble(ConnectionParams::default()).await?;
//!     let mut events = device.take_events().expect("first call");
//!
//!     device.pair(&station).await?;
//!     device.start_session().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

/// Advertisement filtering by station token
pub mod advertisement;
/// btleplug implementation of the transport traits
pub mod ble;
/// Central client orchestrator
pub mod device;
/// Session epochs guarding late callbacks
pub mod epoch;
/// Error types and handling
pub mod error;
/// Station-token handshake
pub mod handshake;
/// Transport traits between the orchestrator and a BLE stack
pub mod link;
/// Packet codec and protocol constants
pub mod protocol;
/// Peripheral session state machine
pub mod session;
/// In-process simulated central and peripheral
pub mod simulated;
/// Telemetry decoding and the mirrored session state
pub mod telemetry;
/// Type definitions and configuration
pub mod types;

// Re-export the main types for convenient usage
pub use device::{LinkLossReason, PairedSession, PuckDevice, PuckEvent};
pub use error::{PuckError, Result};
pub use handshake::HandshakeResult;
pub use protocol::{CommandId, ErrorCode, Packet, PacketType};
pub use session::PuckSession;
pub use telemetry::{SessionMirror, TelemetryEvent};
pub use types::{
    AdvertisementRecord, ConnectionParams, ConnectionState, DeviceId, GattProfile, SessionConfig,
    SessionState, StationId, TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Manufacturer ID under which a Puck advertises its station token
///
/// This is the Bluetooth SIG company identifier of the Puck's platform vendor.
/// The advertisement payload stored under this key is exactly the 8-byte
/// station token, with no prefix or padding.
pub const PUCK_MANUFACTURER_ID: u16 = 0x0590;

/// Primary service UUID of the Nordic UART style Puck profile
pub const PUCK_SERVICE_UUID: uuid::Uuid = uuid::Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// RX characteristic UUID (central → peripheral writes: handshake and commands)
pub const PUCK_RX_CHAR_UUID: uuid::Uuid = uuid::Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// TX characteristic UUID (peripheral → central telemetry notifications)
pub const PUCK_TX_CHAR_UUID: uuid::Uuid = uuid::Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);
