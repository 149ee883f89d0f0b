//! In-process central and peripherals.
//!
//! [`SimulatedCentral`] and [`SimulatedLink`] implement the transport traits
//! on top of channels, and every [`SimulatedPuck`] runs a real
//! [`PuckSession`]. The orchestrator therefore talks to the same state machine
//! the firmware runs, without a radio. Used by the unit tests and by the
//! `simulated_session` demo.

use async_trait::async_trait;
use futures::{
    channel::mpsc::{unbounded, UnboundedSender},
    StreamExt,
};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, trace};

use crate::{
    error::{PuckError, Result},
    link::{
        AdvertisementStream, CharacteristicProps, GattChannel, Notification, NotificationStream,
        PuckCentral, PuckLink,
    },
    protocol::MAX_WRITE_LEN,
    session::{DisconnectReason, Outbound, PuckSession},
    types::{AdvertisementRecord, DeviceId, SessionConfig, SessionState, StationId},
    PUCK_MANUFACTURER_ID,
};

static NEXT_ADDRESS: AtomicU64 = AtomicU64::new(1);

/// How a simulated peripheral answers handshakes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeripheralBehavior {
    notify_rx: bool,
    silent: bool,
}

impl PeripheralBehavior {
    /// Handshake response notified on RX
    #[must_use]
    pub const fn notify() -> Self {
        Self {
            notify_rx: true,
            silent: false,
        }
    }

    /// Handshake response left in RX for the central to read back
    #[must_use]
    pub const fn read_back() -> Self {
        Self {
            notify_rx: false,
            silent: false,
        }
    }

    /// Never answer handshakes
    #[must_use]
    pub const fn silent(self) -> Self {
        Self {
            silent: true,
            ..self
        }
    }
}

impl Default for PeripheralBehavior {
    fn default() -> Self {
        Self::notify()
    }
}

#[derive(Debug)]
struct Connection {
    id: u64,
    subscriptions: HashSet<GattChannel>,
    listeners: Vec<UnboundedSender<Notification>>,
}

impl Connection {
    fn notify(&mut self, channel: GattChannel, value: Vec<u8>) {
        if !self.subscriptions.contains(&channel) {
            return;
        }
        self.listeners.retain(|listener| {
            listener
                .unbounded_send(Notification {
                    channel,
                    value: value.clone(),
                })
                .is_ok()
        });
    }
}

#[derive(Debug)]
struct PuckState {
    session: PuckSession,
    behavior: PeripheralBehavior,
    rx_value: Vec<u8>,
    connection: Option<Connection>,
    in_range: bool,
    fail_writes: usize,
    written: Vec<Vec<u8>>,
}

impl PuckState {
    fn dispatch(&mut self, outbound: Vec<Outbound>) {
        for message in outbound {
            match message {
                Outbound::HandshakeResponse(value) => {
                    if self.behavior.silent {
                        trace!("Silent peripheral swallowing handshake response");
                        continue;
                    }
                    self.rx_value.clone_from(&value);
                    if self.behavior.notify_rx {
                        if let Some(connection) = self.connection.as_mut() {
                            connection.notify(GattChannel::Rx, value);
                        }
                    }
                }
                Outbound::Telemetry(packet) => match packet.to_bytes() {
                    Ok(bytes) => {
                        if let Some(connection) = self.connection.as_mut() {
                            connection.notify(GattChannel::Tx, bytes.to_vec());
                        }
                    }
                    Err(e) => debug!("Peripheral could not encode {packet:?}: {e}"),
                },
            }
        }
    }

    fn is_live(&self, connection_id: u64) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == connection_id)
    }
}

/// Simulated Puck peripheral
///
/// Cloning yields another handle to the same peripheral.
#[derive(Debug, Clone)]
pub struct SimulatedPuck {
    device_id: DeviceId,
    station: StationId,
    advertised: StationId,
    state: Arc<Mutex<PuckState>>,
    connections: Arc<AtomicU64>,
}

impl SimulatedPuck {
    /// Create a Puck paired with `station`, in range and not yet booted
    #[must_use]
    pub fn new(station: StationId, config: SessionConfig) -> Self {
        let address = NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed);
        let device_id = DeviceId::new(format!(
            "C0:98:E5:49:{:02X}:{:02X}",
            (address >> 8) & 0xFF,
            address & 0xFF
        ));

        Self {
            device_id,
            station,
            advertised: station,
            state: Arc::new(Mutex::new(PuckState {
                session: PuckSession::new(station, config),
                behavior: PeripheralBehavior::default(),
                rx_value: Vec::new(),
                connection: None,
                in_range: true,
                fail_writes: 0,
                written: Vec::new(),
            })),
            connections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Change how handshakes are answered
    #[must_use]
    pub fn with_behavior(self, behavior: PeripheralBehavior) -> Self {
        if let Ok(mut state) = self.state.try_lock() {
            state.behavior = behavior;
        }
        self
    }

    /// Advertise `token` instead of the paired station
    ///
    /// Models a stale or cloned advertisement: scans match `token`, the
    /// handshake still checks the paired station.
    #[must_use]
    pub fn with_advertised_token(mut self, token: StationId) -> Self {
        self.advertised = token;
        self
    }

    /// Peer identifier the central sees
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Station the Puck is paired with
    #[must_use]
    pub const fn station(&self) -> &StationId {
        &self.station
    }

    /// Advertisement the Puck broadcasts
    #[must_use]
    pub fn advertisement(&self) -> AdvertisementRecord {
        AdvertisementRecord::new(self.device_id.clone())
            .with_manufacturer_data(PUCK_MANUFACTURER_ID, self.advertised.as_bytes().to_vec())
            .with_local_name("Puck")
            .with_rssi(-58)
    }

    /// Power on and start calibrating
    pub async fn boot(&self) {
        self.drive(PuckSession::boot).await;
    }

    /// Feed `count` identical sensor samples
    pub async fn feed_samples(&self, value: f32, count: usize) {
        for _ in 0..count {
            self.sample(value).await;
        }
    }

    /// Feed one sensor sample
    pub async fn sample(&self, value: f32) {
        let now = Instant::now();
        self.drive(|session| session.on_sample(value, now)).await;
    }

    /// Report a detected motion event
    pub async fn motion(&self) {
        let now = Instant::now();
        self.drive(|session| session.on_motion(now)).await;
    }

    /// Press the button for `held`
    pub async fn press_button(&self, held: Duration) {
        let now = Instant::now();
        self.drive(|session| session.on_button(held, now)).await;
    }

    /// Tap the station's NFC tag
    pub async fn nfc_tap(&self) {
        let now = Instant::now();
        self.drive(|session| session.on_nfc_trigger(now)).await;
    }

    /// Advance the peripheral clock
    pub async fn tick(&self) {
        let now = Instant::now();
        self.drive(|session| session.tick(now)).await;
    }

    /// Tick the peripheral every `period` in a background task
    #[must_use]
    pub fn spawn_clock(&self, period: Duration) -> JoinHandle<()> {
        let puck = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                puck.tick().await;
            }
        })
    }

    /// Update the battery level
    pub async fn set_battery(&self, battery_pct: u8) {
        self.state.lock().await.session.set_battery(battery_pct);
    }

    /// Move the Puck in or out of radio range
    ///
    /// Leaving range drops the current link.
    pub async fn set_in_range(&self, in_range: bool) {
        self.state.lock().await.in_range = in_range;
        if !in_range {
            self.drop_link().await;
        }
    }

    /// Drop the link as if the radio connection was lost
    pub async fn drop_link(&self) {
        let mut state = self.state.lock().await;
        if state.connection.take().is_some() {
            debug!("Simulated link to {} lost", self.device_id);
            state.session.on_disconnect(DisconnectReason::LinkLoss);
        }
    }

    /// Notify raw bytes on TX, bypassing the session
    pub async fn send_raw(&self, value: &[u8]) {
        if let Some(connection) = self.state.lock().await.connection.as_mut() {
            connection.notify(GattChannel::Tx, value.to_vec());
        }
    }

    /// Refuse the next `count` writes
    pub async fn fail_next_writes(&self, count: usize) {
        self.state.lock().await.fail_writes = count;
    }

    /// Every value written to RX so far
    pub async fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.written.clone()
    }

    /// Session state on the peripheral
    pub async fn state(&self) -> SessionState {
        self.state.lock().await.session.state()
    }

    /// Rep count on the peripheral
    pub async fn count(&self) -> u8 {
        self.state.lock().await.session.count()
    }

    /// Check if a central is connected
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connection.is_some()
    }

    async fn is_in_range(&self) -> bool {
        self.state.lock().await.in_range
    }

    async fn drive(&self, input: impl FnOnce(&mut PuckSession) -> Vec<Outbound>) {
        let mut state = self.state.lock().await;
        let outbound = input(&mut state.session);
        state.dispatch(outbound);
    }

    async fn attach(&self) -> SimulatedLink {
        let id = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock().await;
        if state.connection.is_some() {
            state.session.on_disconnect(DisconnectReason::LinkLoss);
        }
        state.connection = Some(Connection {
            id,
            subscriptions: HashSet::new(),
            listeners: Vec::new(),
        });
        state.rx_value.clear();
        state.session.on_connect();
        let behavior = state.behavior;

        SimulatedLink {
            puck: self.clone(),
            connection_id: id,
            behavior,
        }
    }
}

/// Link from the simulated central to one [`SimulatedPuck`]
#[derive(Debug)]
pub struct SimulatedLink {
    puck: SimulatedPuck,
    connection_id: u64,
    behavior: PeripheralBehavior,
}

#[async_trait]
impl PuckLink for SimulatedLink {
    fn device_id(&self) -> &DeviceId {
        self.puck.device_id()
    }

    fn properties(&self, channel: GattChannel) -> CharacteristicProps {
        match channel {
            GattChannel::Rx => CharacteristicProps {
                read: true,
                write: true,
                notify: self.behavior.notify_rx,
            },
            GattChannel::Tx => CharacteristicProps {
                read: false,
                write: false,
                notify: true,
            },
        }
    }

    async fn write(&self, channel: GattChannel, data: &[u8]) -> Result<()> {
        if channel != GattChannel::Rx {
            return Err(PuckError::WriteFailed("TX is not writable".to_string()));
        }
        if data.len() > MAX_WRITE_LEN {
            return Err(PuckError::WriteFailed(format!(
                "{} bytes exceed the attribute length",
                data.len()
            )));
        }

        let mut state = self.puck.state.lock().await;
        if !state.is_live(self.connection_id) {
            return Err(PuckError::GattDisconnected);
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(PuckError::WriteFailed("GATT write refused".to_string()));
        }

        state.written.push(data.to_vec());
        let outbound = state.session.on_write(data, Instant::now());
        state.dispatch(outbound);
        Ok(())
    }

    async fn read(&self, channel: GattChannel) -> Result<Vec<u8>> {
        let state = self.puck.state.lock().await;
        if !state.is_live(self.connection_id) {
            return Err(PuckError::GattDisconnected);
        }
        match channel {
            GattChannel::Rx => Ok(state.rx_value.clone()),
            GattChannel::Tx => Err(PuckError::Protocol("TX is not readable".to_string())),
        }
    }

    async fn subscribe(&self, channel: GattChannel) -> Result<()> {
        let mut state = self.puck.state.lock().await;
        let connection = state
            .connection
            .as_mut()
            .filter(|c| c.id == self.connection_id)
            .ok_or(PuckError::GattDisconnected)?;

        if connection.subscriptions.insert(channel) && channel == GattChannel::Tx {
            let outbound = state.session.on_subscribed(Instant::now());
            state.dispatch(outbound);
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let mut state = self.puck.state.lock().await;
        let connection = state
            .connection
            .as_mut()
            .filter(|c| c.id == self.connection_id)
            .ok_or(PuckError::GattDisconnected)?;

        let (sender, receiver) = unbounded();
        connection.listeners.push(sender);
        Ok(receiver.boxed())
    }

    async fn is_connected(&self) -> bool {
        self.puck.state.lock().await.is_live(self.connection_id)
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.puck.state.lock().await;
        if state.is_live(self.connection_id) {
            state.connection = None;
            state.session.on_disconnect(DisconnectReason::Explicit);
        }
        Ok(())
    }
}

/// Simulated central adapter
#[derive(Debug)]
pub struct SimulatedCentral {
    pucks: Vec<SimulatedPuck>,
    extra_adverts: Vec<AdvertisementRecord>,
    listeners: Mutex<Vec<UnboundedSender<AdvertisementRecord>>>,
    scanning: AtomicBool,
    scan_starts: AtomicUsize,
    scan_stops: AtomicUsize,
    connect_failures: AtomicU32,
    connect_delay: Duration,
}

impl SimulatedCentral {
    /// Create a central that can see `pucks`
    #[must_use]
    pub fn new(pucks: Vec<SimulatedPuck>) -> Self {
        Self {
            pucks,
            extra_adverts: Vec::new(),
            listeners: Mutex::new(Vec::new()),
            scanning: AtomicBool::new(false),
            scan_starts: AtomicUsize::new(0),
            scan_stops: AtomicUsize::new(0),
            connect_failures: AtomicU32::new(0),
            connect_delay: Duration::ZERO,
        }
    }

    /// Also report an unrelated advertisement on every scan
    #[must_use]
    pub fn with_advertisement(mut self, record: AdvertisementRecord) -> Self {
        self.extra_adverts.push(record);
        self
    }

    /// Take `delay` to establish each link
    #[must_use]
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Fail the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Check if a scan is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Number of scans started so far
    #[must_use]
    pub fn scan_starts(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    /// Number of scans stopped so far
    #[must_use]
    pub fn scan_stops(&self) -> usize {
        self.scan_stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PuckCentral for SimulatedCentral {
    type Link = SimulatedLink;

    async fn advertisements(&self) -> Result<AdvertisementStream> {
        let (sender, receiver) = unbounded();
        self.listeners.lock().await.push(sender);
        Ok(receiver.boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        self.scanning.store(true, Ordering::SeqCst);
        self.scan_starts.fetch_add(1, Ordering::SeqCst);

        let mut records = self.extra_adverts.clone();
        for puck in &self.pucks {
            if puck.is_in_range().await {
                records.push(puck.advertisement());
            }
        }

        let mut listeners = self.listeners.lock().await;
        for record in records {
            listeners.retain(|listener| listener.unbounded_send(record.clone()).is_ok());
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        self.scan_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<SimulatedLink> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let failures = self.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.connect_failures.store(failures - 1, Ordering::SeqCst);
            return Err(PuckError::ConnectionFailed(format!(
                "simulated connection failure to {device}"
            )));
        }

        let puck = self
            .pucks
            .iter()
            .find(|puck| puck.device_id() == device)
            .ok_or(PuckError::DeviceNotFound)?;

        if !puck.is_in_range().await {
            return Err(PuckError::ConnectionFailed(format!("{device} is out of range")));
        }

        Ok(puck.attach().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::CommandId, types::DEFAULT_CALIBRATION_SAMPLES};

    fn puck() -> SimulatedPuck {
        SimulatedPuck::new(StationId::new("LEGEXT01").unwrap(), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_scan_reports_pucks_in_range() {
        let near = puck();
        let far = puck();
        far.set_in_range(false).await;
        let central = SimulatedCentral::new(vec![near.clone(), far.clone()]);

        let mut adverts = central.advertisements().await.unwrap();
        central.start_scan().await.unwrap();
        assert!(central.is_scanning());

        let record = adverts.next().await.unwrap();
        assert_eq!(&record.device_id, near.device_id());
        assert_eq!(
            record.manufacturer_data.get(&PUCK_MANUFACTURER_ID).unwrap(),
            b"LEGEXT01"
        );

        central.stop_scan().await.unwrap();
        assert_eq!(central.scan_stops(), 1);
    }

    #[tokio::test]
    async fn test_telemetry_flows_after_handshake_and_subscribe() {
        let puck = puck();
        puck.boot().await;
        puck.feed_samples(1.0, DEFAULT_CALIBRATION_SAMPLES).await;
        let central = SimulatedCentral::new(vec![puck.clone()]);
        let link = central.connect(puck.device_id()).await.unwrap();

        let mut notifications = link.notifications().await.unwrap();
        link.write(GattChannel::Rx, b"LEGEXT01").await.unwrap();
        link.subscribe(GattChannel::Tx).await.unwrap();

        let ack = notifications.next().await.unwrap();
        assert_eq!(ack.channel, GattChannel::Tx);
        assert_eq!(ack.value, vec![0x02, 0x00]);
        let status = notifications.next().await.unwrap();
        assert_eq!(status.value, vec![0x03, 0, 0, 100, 1]);

        link.write(GattChannel::Rx, &[CommandId::StartSession as u8])
            .await
            .unwrap();
        puck.motion().await;
        assert_eq!(notifications.next().await.unwrap().value[0], 0x03);
        assert_eq!(notifications.next().await.unwrap().value, vec![0x01, 0x01]);
    }

    #[tokio::test]
    async fn test_link_loss_ends_streams_and_refuses_writes() {
        let puck = puck();
        let central = SimulatedCentral::new(vec![puck.clone()]);
        let link = central.connect(puck.device_id()).await.unwrap();
        let mut notifications = link.notifications().await.unwrap();

        puck.drop_link().await;
        assert!(notifications.next().await.is_none());
        assert!(!link.is_connected().await);
        assert!(matches!(
            link.write(GattChannel::Rx, b"LEGEXT01").await,
            Err(PuckError::GattDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_injected_connect_failures() {
        let puck = puck();
        let central = SimulatedCentral::new(vec![puck.clone()]);
        central.fail_next_connects(1);

        assert!(matches!(
            central.connect(puck.device_id()).await,
            Err(PuckError::ConnectionFailed(_))
        ));
        assert!(central.connect(puck.device_id()).await.is_ok());
        assert!(matches!(
            central.connect(&DeviceId::new("00:00:00:00:00:00")).await,
            Err(PuckError::DeviceNotFound)
        ));
    }
}
