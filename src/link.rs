//! Transport seam between the orchestrator and a BLE stack.
//!
//! [`crate::device::PuckDevice`] is the only caller of these traits. The
//! codec, filter, handshake helpers and telemetry decoder only see byte
//! slices, so all protocol logic runs against [`crate::simulated`] in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
    error::Result,
    types::{AdvertisementRecord, DeviceId},
};

/// Characteristic on the Puck service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattChannel {
    /// Handshake and command characteristic
    Rx,
    /// Telemetry characteristic
    Tx,
}

/// Capability flags of a characteristic, captured at discovery time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct CharacteristicProps {
    /// Readable
    pub read: bool,
    /// Writable (with or without response)
    pub write: bool,
    /// Supports notifications or indications
    pub notify: bool,
}

/// Value notification from the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic that notified
    pub channel: GattChannel,
    /// Raw value
    pub value: Vec<u8>,
}

/// Stream of advertisements seen while scanning
pub type AdvertisementStream = BoxStream<'static, AdvertisementRecord>;

/// Stream of notifications in the order the peripheral sent them
pub type NotificationStream = BoxStream<'static, Notification>;

/// Central role: scanning and connecting
#[async_trait]
pub trait PuckCentral: Send + Sync + 'static {
    /// Link type produced by [`PuckCentral::connect`]
    type Link: PuckLink;

    /// Advertisements delivered from now on
    ///
    /// Take the stream before [`PuckCentral::start_scan`] so no result is missed.
    async fn advertisements(&self) -> Result<AdvertisementStream>;

    /// Start scanning
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a device and discover the Puck service
    async fn connect(&self, device: &DeviceId) -> Result<Self::Link>;
}

/// One established link to a Puck
#[async_trait]
pub trait PuckLink: Send + Sync + 'static {
    /// Peer identifier
    fn device_id(&self) -> &DeviceId;

    /// Capabilities of a characteristic
    fn properties(&self, channel: GattChannel) -> CharacteristicProps;

    /// Write a value (with response)
    async fn write(&self, channel: GattChannel, data: &[u8]) -> Result<()>;

    /// Read a value
    async fn read(&self, channel: GattChannel) -> Result<Vec<u8>>;

    /// Enable notifications on a characteristic
    async fn subscribe(&self, channel: GattChannel) -> Result<()>;

    /// Notifications delivered from now on
    async fn notifications(&self) -> Result<NotificationStream>;

    /// Check if the link is still up
    async fn is_connected(&self) -> bool;

    /// Close the link
    async fn disconnect(&self) -> Result<()>;
}
