use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::{future::BoxFuture, stream::StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::{
    error::{PuckError, Result},
    link::{
        AdvertisementStream, CharacteristicProps, GattChannel, Notification, NotificationStream,
        PuckCentral, PuckLink,
    },
    types::{AdvertisementRecord, DeviceId, GattProfile},
};

/// Central backed by the host's Bluetooth adapter
pub struct BleCentral {
    adapter: Adapter,
    profile: GattProfile,
    peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
}

impl BleCentral {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::DeviceNotFound`] if no Bluetooth adapters are available,
    /// or [`PuckError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new(profile: GattProfile) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(PuckError::DeviceNotFound)?;

        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);

        Ok(Self {
            adapter,
            profile,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

/// Scan record for a peripheral the adapter reported
async fn advertisement_of(
    adapter: &Adapter,
    id: &btleplug::platform::PeripheralId,
    peripherals: &Mutex<HashMap<DeviceId, Peripheral>>,
) -> Option<AdvertisementRecord> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let device_id = DeviceId::new(properties.address.to_string());

    let mut record = AdvertisementRecord::new(device_id.clone());
    record.manufacturer_data = properties.manufacturer_data;
    record.local_name = properties.local_name;
    record.rssi = properties.rssi;

    peripherals.lock().await.insert(device_id, peripheral);
    Some(record)
}

/// Map a GATT failure on an established link
///
/// A peripheral that is gone reports [`PuckError::GattDisconnected`], a live
/// one that still failed reports [`PuckError::ConnectionFailed`]. Errors that
/// another attempt cannot fix stay [`PuckError::Ble`].
fn gatt_error(error: btleplug::Error, connected: bool) -> PuckError {
    match error {
        btleplug::Error::PermissionDenied | btleplug::Error::NotSupported(_) => {
            PuckError::Ble(error)
        }
        _ if !connected => PuckError::GattDisconnected,
        other => PuckError::ConnectionFailed(other.to_string()),
    }
}

async fn classify(peripheral: &Peripheral, error: btleplug::Error) -> PuckError {
    let connected = peripheral.is_connected().await.unwrap_or(false);
    gatt_error(error, connected)
}

/// Peripheral whose link can be torn down without waiting on it
trait Release: Send + 'static {
    fn release(self) -> BoxFuture<'static, ()>;
}

impl Release for Peripheral {
    fn release(self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = btleplug::api::Peripheral::disconnect(&self).await {
                debug!("Disconnect of half-open link failed: {e}");
            }
        })
    }
}

/// Disconnects a peripheral on drop unless the connection completed
///
/// Covers early returns during discovery as well as a caller timeout
/// dropping the connect future.
struct PendingConnection<P: Release> {
    peripheral: Option<P>,
}

impl<P: Release> PendingConnection<P> {
    const fn new(peripheral: P) -> Self {
        Self {
            peripheral: Some(peripheral),
        }
    }

    fn complete(mut self) {
        self.peripheral = None;
    }
}

impl<P: Release> Drop for PendingConnection<P> {
    fn drop(&mut self) {
        if let Some(peripheral) = self.peripheral.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                debug!("Releasing half-open connection");
                handle.spawn(peripheral.release());
            }
        }
    }
}

#[async_trait]
impl PuckCentral for BleCentral {
    type Link = BleLink;

    async fn advertisements(&self) -> Result<AdvertisementStream> {
        let events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let peripherals = Arc::clone(&self.peripherals);

        let records = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = Arc::clone(&peripherals);
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                        advertisement_of(&adapter, &id, &peripherals).await
                    }
                    _ => None,
                }
            }
        });

        Ok(records.boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        info!("Starting BLE scan");
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        debug!("Stopping BLE scan");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<BleLink> {
        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(device)
            .cloned()
            .ok_or(PuckError::DeviceNotFound)?;

        info!("Connecting to {device}");
        let pending = PendingConnection::new(peripheral.clone());
        peripheral
            .connect()
            .await
            .map_err(|e| PuckError::ConnectionFailed(e.to_string()))?;
        if let Err(e) = peripheral.discover_services().await {
            return Err(classify(&peripheral, e).await);
        }

        let characteristics = peripheral.characteristics();
        let find = |uuid: uuid::Uuid, name: &str| {
            characteristics
                .iter()
                .find(|c| c.service_uuid == self.profile.service && c.uuid == uuid)
                .cloned()
                .ok_or_else(|| PuckError::Protocol(format!("{name} characteristic not found")))
        };
        let rx = find(self.profile.rx, "RX")?;
        let tx = find(self.profile.tx, "TX")?;

        pending.complete();
        info!("Connected to {device}");

        Ok(BleLink {
            device_id: device.clone(),
            peripheral,
            rx,
            tx,
        })
    }
}

/// Link to a Puck over the host's Bluetooth stack
pub struct BleLink {
    device_id: DeviceId,
    peripheral: Peripheral,
    rx: Characteristic,
    tx: Characteristic,
}

impl BleLink {
    fn characteristic(&self, channel: GattChannel) -> &Characteristic {
        match channel {
            GattChannel::Rx => &self.rx,
            GattChannel::Tx => &self.tx,
        }
    }
}

fn props_of(flags: CharPropFlags) -> CharacteristicProps {
    CharacteristicProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl PuckLink for BleLink {
    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn properties(&self, channel: GattChannel) -> CharacteristicProps {
        props_of(self.characteristic(channel).properties)
    }

    async fn write(&self, channel: GattChannel, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(channel);
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        trace!("Writing {:02X?} to {channel:?}", data);
        self.peripheral
            .write(characteristic, data, write_type)
            .await
            .map_err(|e| PuckError::WriteFailed(e.to_string()))
    }

    async fn read(&self, channel: GattChannel) -> Result<Vec<u8>> {
        match self.peripheral.read(self.characteristic(channel)).await {
            Ok(value) => Ok(value),
            Err(e) => Err(classify(&self.peripheral, e).await),
        }
    }

    async fn subscribe(&self, channel: GattChannel) -> Result<()> {
        debug!("Subscribing to {channel:?}");
        if let Err(e) = self.peripheral.subscribe(self.characteristic(channel)).await {
            return Err(classify(&self.peripheral, e).await);
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let rx = self.rx.uuid;
        let tx = self.tx.uuid;
        let stream = match self.peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => return Err(classify(&self.peripheral, e).await),
        };

        Ok(stream
            .filter_map(move |notification| async move {
                let channel = if notification.uuid == tx {
                    GattChannel::Tx
                } else if notification.uuid == rx {
                    GattChannel::Rx
                } else {
                    return None;
                };
                Some(Notification {
                    channel,
                    value: notification.value,
                })
            })
            .boxed())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_characteristic_props_mapping() {
        let rx = props_of(CharPropFlags::WRITE | CharPropFlags::NOTIFY);
        assert!(rx.write && rx.notify && !rx.read);

        let read_back = props_of(CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::READ);
        assert!(read_back.write && read_back.read && !read_back.notify);

        let tx = props_of(CharPropFlags::INDICATE);
        assert!(tx.notify && !tx.write);
    }

    #[test]
    fn test_gatt_errors_on_dropped_link_are_transient() {
        let dropped = gatt_error(btleplug::Error::RuntimeError("GATT busy".to_string()), false);
        assert!(matches!(dropped, PuckError::GattDisconnected));
        assert!(dropped.is_transient());

        let live = gatt_error(btleplug::Error::TimedOut(std::time::Duration::from_secs(3)), true);
        assert!(matches!(live, PuckError::ConnectionFailed(_)));
        assert!(live.is_transient());

        let denied = gatt_error(btleplug::Error::PermissionDenied, false);
        assert!(matches!(denied, PuckError::Ble(btleplug::Error::PermissionDenied)));
        assert!(!denied.is_transient());
    }

    struct FakePeripheral(Arc<AtomicBool>);

    impl Release for FakePeripheral {
        fn release(self) -> BoxFuture<'static, ()> {
            Box::pin(async move { self.0.store(true, Ordering::SeqCst) })
        }
    }

    #[tokio::test]
    async fn test_failed_setup_releases_peripheral() {
        let released = Arc::new(AtomicBool::new(false));
        let setup = async {
            let _pending = PendingConnection::new(FakePeripheral(Arc::clone(&released)));
            Err::<(), _>(PuckError::Protocol("RX characteristic not found".to_string()))
        };
        assert!(setup.await.is_err());

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_setup_releases_peripheral() {
        let released = Arc::new(AtomicBool::new(false));
        let setup = async {
            let _pending = PendingConnection::new(FakePeripheral(Arc::clone(&released)));
            std::future::pending::<()>().await;
        };
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), setup).await;
        assert!(outcome.is_err());

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_completed_setup_keeps_peripheral() {
        let released = Arc::new(AtomicBool::new(false));
        let pending = PendingConnection::new(FakePeripheral(Arc::clone(&released)));
        pending.complete();

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(!released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_nordic_uart_profile() {
        let profile = GattProfile::default();
        assert_eq!(profile.service, crate::PUCK_SERVICE_UUID);
        assert_eq!(profile.rx, crate::PUCK_RX_CHAR_UUID);
        assert_eq!(profile.tx, crate::PUCK_TX_CHAR_UUID);
    }
}
