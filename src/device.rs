use crate::{
    advertisement::{matches_station, station_of},
    ble::BleCentral,
    epoch::SessionEpoch,
    error::{PuckError, Result},
    handshake::{perform_handshake, HandshakeResult},
    link::{GattChannel, NotificationStream, PuckCentral, PuckLink},
    protocol::{encode_command, CommandId},
    telemetry::{SessionMirror, TelemetryEvent, TelemetryStream},
    types::{
        AdvertisementRecord, ConnectionParams, ConnectionState, DeviceId, StationId,
        TimeoutConfig,
    },
};
use futures::{future::BoxFuture, StreamExt};
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Mutex, Notify, RwLock},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, error, info, trace, warn};

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PuckEvent {
    /// An attempt failed with a transient error and another one follows
    Retrying {
        /// Attempt about to start (1-based)
        attempt: u32,
        /// Attempts allowed in total
        max_attempts: u32,
        /// Why the previous attempt failed
        error: String,
    },
    /// Handshake passed and telemetry is subscribed
    Paired {
        /// Peripheral the link is established with
        device: DeviceId,
        /// Count the peripheral reported in its handshake response
        reconciled_count: Option<u8>,
    },
    /// Decoded telemetry, in arrival order
    Telemetry(TelemetryEvent),
    /// The established link went away without a local disconnect
    LinkLost {
        /// How the loss was noticed
        reason: LinkLossReason,
    },
}

/// How a link loss was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLossReason {
    /// The BLE stack reported the peripheral as disconnected
    Disconnected,
    /// The notification stream ended
    NotificationsEnded,
    /// No packet arrived within the heartbeat timeout
    Silent,
}

impl fmt::Display for LinkLossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "peripheral disconnected"),
            Self::NotificationsEnded => write!(f, "notification stream ended"),
            Self::Silent => write!(f, "heartbeat timeout"),
        }
    }
}

/// Outcome of a successful [`PuckDevice::pair`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedSession {
    /// Peripheral the link is established with
    pub device: DeviceId,
    /// Station the peripheral accepted
    pub station: StationId,
    /// Count the peripheral reported in its handshake response
    pub reconciled_count: Option<u8>,
    /// Attempts it took, including the successful one
    pub attempts: u32,
}

struct Inner<C: PuckCentral> {
    central: C,
    params: ConnectionParams,
    timeouts: TimeoutConfig,
    epoch: SessionEpoch,
    scanning: AtomicBool,
    link: Mutex<Option<Arc<C::Link>>>,
    telemetry: RwLock<TelemetryStream>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<PuckEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<PuckEvent>>>,
    cancel: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    station: Mutex<Option<StationId>>,
}

impl<C: PuckCentral> Inner<C> {
    fn set_state(&self, epoch: u64, state: ConnectionState) {
        if self.epoch.is_current(epoch) {
            debug!("Connection state: {state}");
            self.state.send_replace(state);
        }
    }

    fn emit(&self, event: PuckEvent) {
        if self.events.send(event).is_err() {
            trace!("No event receiver, dropping event");
        }
    }

    async fn abort_tasks(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    async fn release_link(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            debug!("Releasing link to {}", link.device_id());
            if let Err(e) = link.disconnect().await {
                debug!("Disconnect during cleanup failed: {e}");
            }
        }
    }

    async fn link_lost(self: &Arc<Self>, epoch: u64, reason: LinkLossReason) {
        if !self.epoch.retire(epoch) {
            return;
        }

        warn!("Link lost: {reason}");
        self.release_link().await;
        self.state.send_replace(ConnectionState::Disconnected);
        self.emit(PuckEvent::LinkLost { reason });

        let station = *self.station.lock().await;
        if let (true, Some(station)) = (self.params.auto_reconnect, station) {
            self.spawn_reconnect(station).await;
        }
    }

    async fn spawn_reconnect(self: &Arc<Self>, station: StationId) {
        info!("Reconnecting to station {station}");
        let task = tokio::spawn(reconnect(Arc::clone(self), station));
        if let Some(previous) = self.reconnect.lock().await.replace(task) {
            previous.abort();
        }
    }
}

fn reconnect<C: PuckCentral>(inner: Arc<Inner<C>>, station: StationId) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let device = PuckDevice { inner };
        if let Err(e) = device.pair(&station).await {
            error!("Reconnect to station {station} failed: {e}");
        }
    })
}

impl<C: PuckCentral> Drop for Inner<C> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(task) = self.reconnect.get_mut().take() {
            task.abort();
        }

        if let Some(link) = self.link.get_mut().take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = link.disconnect().await;
                });
            }
        }
    }
}

/// Central-side client for one Puck station
///
/// `PuckDevice` runs the pairing pipeline (scan, connect, handshake,
/// subscribe) against any [`PuckCentral`], forwards decoded telemetry as
/// [`PuckEvent`]s and sends session commands. It owns at most one scan and
/// one link at a time. Handles are cheap to clone and share the same client.
///
/// # Examples
///
/// ```no_run
/// use pucklink::{ConnectionParams, PuckDevice, PuckEvent, StationId, TelemetryEvent};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let device = PuckDevice::with_ble(ConnectionParams::default()).await?;
///     let mut events = device.take_events().expect("events taken once");
///
///     let paired = device.pair(&StationId::new("LEGEXT01")?).await?;
///     println!("Paired with {} after {} attempt(s)", paired.device, paired.attempts);
///
///     device.start_session().await?;
///     while let Some(event) = events.recv().await {
///         if let PuckEvent::Telemetry(TelemetryEvent::RepCount { count }) = event {
///             println!("Reps: {count}");
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct PuckDevice<C: PuckCentral = BleCentral> {
    inner: Arc<Inner<C>>,
}

impl<C: PuckCentral> Clone for PuckDevice<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PuckDevice<BleCentral> {
    /// Create a client on the host's first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::DeviceNotFound`] if no adapter is available, or
    /// [`PuckError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn with_ble(params: ConnectionParams) -> Result<Self> {
        let central = BleCentral::new(params.profile).await?;
        Ok(Self::new(central, params, TimeoutConfig::default()))
    }
}

impl<C: PuckCentral> PuckDevice<C> {
    /// Create a client on top of `central`
    #[must_use]
    pub fn new(central: C, params: ConnectionParams, timeouts: TimeoutConfig) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);

        Self {
            inner: Arc::new(Inner {
                central,
                params,
                timeouts,
                epoch: SessionEpoch::new(),
                scanning: AtomicBool::new(false),
                link: Mutex::new(None),
                telemetry: RwLock::new(TelemetryStream::new()),
                state,
                events,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
                cancel: Notify::new(),
                tasks: Mutex::new(Vec::new()),
                reconnect: Mutex::new(None),
                station: Mutex::new(None),
            }),
        }
    }

    /// Central this client drives
    #[must_use]
    pub fn central(&self) -> &C {
        &self.inner.central
    }

    /// Receiver for [`PuckEvent`]s
    ///
    /// Returns `None` after the first call.
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PuckEvent>> {
        self.inner.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the mirrored peripheral session
    pub async fn mirror(&self) -> SessionMirror {
        self.inner.telemetry.read().await.mirror().clone()
    }

    /// Check if an authenticated, subscribed link is up
    pub async fn is_connected(&self) -> bool {
        if !self.state().is_ready() {
            return false;
        }
        match self.inner.link.lock().await.as_ref() {
            Some(link) => link.is_connected().await,
            None => false,
        }
    }

    /// Scan until the Puck advertising `station` shows up
    ///
    /// The scan is stopped on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::AlreadyScanning`] if a scan is already running,
    /// [`PuckError::ScanTimeout`] if nothing matched within `window`, or
    /// [`PuckError::Cancelled`] if the client was cancelled meanwhile.
    pub async fn scan(&self, station: &StationId, window: Duration) -> Result<AdvertisementRecord> {
        self.scan_at(station, window, self.inner.epoch.current())
            .await
    }

    /// Connect to a scanned peripheral, replacing any previous link
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::ConnectionFailed`] if the link cannot be
    /// established within the connect timeout, [`PuckError::DeviceNotFound`]
    /// if the peripheral is unknown to the central, or
    /// [`PuckError::Cancelled`] if the client was cancelled meanwhile.
    pub async fn connect(&self, device: &DeviceId) -> Result<()> {
        self.connect_at(device, self.inner.epoch.current()).await
    }

    /// Present `station` to the connected peripheral
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::HandshakeRejected`] if the peripheral belongs to
    /// another station, [`PuckError::HandshakeTimeout`] if it does not answer,
    /// [`PuckError::NotReady`] without a link, or the transport error that
    /// interrupted the exchange.
    pub async fn handshake(&self, station: &StationId) -> Result<HandshakeResult> {
        self.handshake_at(station, self.inner.epoch.current())
            .await
    }

    /// Enable telemetry and start forwarding it as [`PuckEvent::Telemetry`]
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::NotReady`] without a link, or
    /// [`PuckError::ConnectionFailed`] if the subscription does not complete
    /// within the subscribe timeout.
    pub async fn subscribe(&self) -> Result<()> {
        self.subscribe_at(self.inner.epoch.current()).await
    }

    /// Find, connect to and authenticate with the Puck of `station`
    ///
    /// Transient failures are retried up to [`ConnectionParams::max_attempts`]
    /// times with [`ConnectionParams::retry_delay_ms`] between attempts, each
    /// retry announced as [`PuckEvent::Retrying`]. Every failed attempt
    /// releases its scan and link before the next one starts.
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::HandshakeRejected`] immediately if the Puck
    /// belongs to another station, [`PuckError::Cancelled`] if
    /// [`PuckDevice::cancel`] or [`PuckDevice::disconnect`] interrupts it,
    /// [`PuckError::RetriesExhausted`] once every attempt failed
    /// transiently, or any other non-transient error as is.
    pub async fn pair(&self, station: &StationId) -> Result<PairedSession> {
        let epoch = self.inner.epoch.advance();
        *self.inner.station.lock().await = Some(*station);
        self.inner.abort_tasks().await;
        self.inner.release_link().await;

        let max_attempts = self.inner.params.max_attempts.max(1);
        let mut attempt = 1;
        info!("Pairing with station {station} ({max_attempts} attempts allowed)");

        loop {
            self.inner.telemetry.write().await.reset();

            let error = match self.attempt(station, epoch).await {
                Ok((device, reconciled_count)) => {
                    info!("Paired with {device} for station {station} on attempt {attempt}");
                    self.inner.emit(PuckEvent::Paired {
                        device: device.clone(),
                        reconciled_count,
                    });
                    return Ok(PairedSession {
                        device,
                        station: *station,
                        reconciled_count,
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            self.inner.abort_tasks().await;
            self.inner.release_link().await;

            if !error.is_transient() {
                error!("Pairing with station {station} failed: {error}");
                self.inner.set_state(epoch, ConnectionState::Disconnected);
                return Err(error);
            }

            if attempt >= max_attempts {
                error!("Pairing with station {station} failed after {attempt} attempts: {error}");
                self.inner.set_state(epoch, ConnectionState::Disconnected);
                return Err(PuckError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            attempt += 1;
            warn!(
                "Attempt {}/{max_attempts} failed, retrying in {}ms: {error}",
                attempt - 1,
                self.inner.params.retry_delay_ms
            );
            self.inner
                .set_state(epoch, ConnectionState::Retrying { attempt });
            self.inner.emit(PuckEvent::Retrying {
                attempt,
                max_attempts,
                error: error.to_string(),
            });

            let delay = self.inner.params.retry_delay();
            self.guarded(epoch, async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }
    }

    /// Start counting (Armed → Active)
    ///
    /// # Errors
    ///
    /// See [`PuckDevice::send_command`].
    pub async fn start_session(&self) -> Result<()> {
        self.send_command(CommandId::StartSession, &[]).await
    }

    /// Stop counting (Active → Stopped)
    ///
    /// # Errors
    ///
    /// See [`PuckDevice::send_command`].
    pub async fn stop_session(&self) -> Result<()> {
        self.send_command(CommandId::StopSession, &[]).await
    }

    /// Collect a new baseline
    ///
    /// # Errors
    ///
    /// See [`PuckDevice::send_command`].
    pub async fn calibrate(&self) -> Result<()> {
        self.send_command(CommandId::Calibrate, &[]).await
    }

    /// Zero the counter and return the Puck to Idle
    ///
    /// # Errors
    ///
    /// See [`PuckDevice::send_command`].
    pub async fn reset(&self) -> Result<()> {
        self.send_command(CommandId::Reset, &[]).await
    }

    /// Write a command to the paired Puck
    ///
    /// A failed write is reported to the caller and leaves the link in place.
    /// Whether the Puck accepted the command shows up in telemetry.
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::NotReady`] before pairing completed,
    /// [`PuckError::PayloadTooLarge`] if the command exceeds one write, or
    /// [`PuckError::WriteFailed`] if the write is refused or times out.
    pub async fn send_command(&self, command: CommandId, args: &[u8]) -> Result<()> {
        let data = encode_command(command as u8, args)?;

        let state = self.state();
        if !state.is_ready() {
            return Err(PuckError::NotReady {
                reason: format!("cannot send {command} while {state}"),
            });
        }
        let link = self.current_link().await?;

        debug!("Sending {command}: {:02X?}", &data[..]);
        let timeout_ms = self.inner.timeouts.command_timeout_ms;
        match timeout(Duration::from_millis(timeout_ms), link.write(GattChannel::Rx, &data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("{command} failed: {e}");
                Err(e)
            }
            Err(_) => {
                warn!("{command} timed out after {timeout_ms}ms");
                Err(PuckError::WriteFailed(format!(
                    "{command} not acknowledged within {timeout_ms}ms"
                )))
            }
        }
    }

    /// Close the link and stop everything in flight
    ///
    /// Pending retries and timers become inert and auto-reconnect is
    /// disarmed. The Puck ends an active session on an explicit disconnect.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the link could not be closed cleanly.
    /// Local state is torn down either way.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting");
        let link = self.teardown().await;
        if let Some(link) = link {
            link.disconnect().await?;
        }
        Ok(())
    }

    /// Abort any pairing in progress and tear the link down
    pub async fn cancel(&self) {
        info!("Cancelling");
        if let Some(link) = self.teardown().await {
            if let Err(e) = link.disconnect().await {
                debug!("Disconnect during cancel failed: {e}");
            }
        }
    }

    async fn teardown(&self) -> Option<Arc<C::Link>> {
        let epoch = self.inner.epoch.advance();
        self.inner.cancel.notify_waiters();
        *self.inner.station.lock().await = None;

        self.inner.abort_tasks().await;
        if let Some(task) = self.inner.reconnect.lock().await.take() {
            task.abort();
        }
        if self.inner.scanning.load(Ordering::Acquire) {
            if let Err(e) = self.inner.central.stop_scan().await {
                debug!("Stopping scan during teardown failed: {e}");
            }
        }

        self.inner.set_state(epoch, ConnectionState::Disconnected);
        self.inner.link.lock().await.take()
    }

    async fn attempt(&self, station: &StationId, epoch: u64) -> Result<(DeviceId, Option<u8>)> {
        let record = self
            .scan_at(station, self.inner.params.scan_window(), epoch)
            .await?;
        self.connect_at(&record.device_id, epoch).await?;

        let reconciled_count = match self.handshake_at(station, epoch).await? {
            HandshakeResult::Authenticated { reconciled_count } => reconciled_count,
            HandshakeResult::Rejected | HandshakeResult::TimedOut => None,
        };

        self.subscribe_at(epoch).await?;
        Ok((record.device_id, reconciled_count))
    }

    /// Run a stage unless the client is cancelled first
    async fn guarded<T>(&self, epoch: u64, stage: impl Future<Output = Result<T>>) -> Result<T> {
        let cancelled = self.inner.cancel.notified();
        if !self.inner.epoch.is_current(epoch) {
            return Err(PuckError::Cancelled);
        }

        tokio::select! {
            result = stage => result,
            () = cancelled => Err(PuckError::Cancelled),
        }
    }

    async fn current_link(&self) -> Result<Arc<C::Link>> {
        self.inner
            .link
            .lock()
            .await
            .clone()
            .ok_or_else(|| PuckError::NotReady {
                reason: "no link".to_string(),
            })
    }

    async fn scan_at(
        &self,
        station: &StationId,
        window: Duration,
        epoch: u64,
    ) -> Result<AdvertisementRecord> {
        if self.inner.scanning.swap(true, Ordering::AcqRel) {
            return Err(PuckError::AlreadyScanning);
        }

        self.inner.set_state(epoch, ConnectionState::Scanning);
        info!("Scanning for station {station} ({}ms window)", window.as_millis());
        let result = self.guarded(epoch, self.find_station(station, window)).await;

        if let Err(e) = self.inner.central.stop_scan().await {
            warn!("Failed to stop scan: {e}");
        }
        self.inner.scanning.store(false, Ordering::Release);

        match &result {
            Ok(record) => info!("Found station {station} on {}", record.device_id),
            Err(e) => debug!("Scan ended without a match: {e}"),
        }
        result
    }

    async fn find_station(&self, station: &StationId, window: Duration) -> Result<AdvertisementRecord> {
        let mut adverts = self.inner.central.advertisements().await?;
        self.inner.central.start_scan().await?;

        let search = async {
            while let Some(record) = adverts.next().await {
                if matches_station(&record, station) {
                    return Ok(record);
                }
                if let Some(other) = station_of(&record) {
                    trace!("Ignoring {} advertising station {other}", record.device_id);
                }
            }
            Err(PuckError::DeviceNotFound)
        };

        timeout(window, search)
            .await
            .unwrap_or(Err(PuckError::ScanTimeout {
                window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            }))
    }

    async fn connect_at(&self, device: &DeviceId, epoch: u64) -> Result<()> {
        self.inner.release_link().await;
        self.inner.set_state(epoch, ConnectionState::Connecting);

        let timeout_ms = self.inner.timeouts.connect_timeout_ms;
        let link = self
            .guarded(epoch, async {
                timeout(Duration::from_millis(timeout_ms), self.inner.central.connect(device))
                    .await
                    .unwrap_or_else(|_| {
                        Err(PuckError::ConnectionFailed(format!(
                            "connect to {device} timed out after {timeout_ms}ms"
                        )))
                    })
            })
            .await?;

        let mut slot = self.inner.link.lock().await;
        if !self.inner.epoch.is_current(epoch) {
            drop(slot);
            if let Err(e) = link.disconnect().await {
                debug!("Disconnect of superseded link failed: {e}");
            }
            return Err(PuckError::Cancelled);
        }

        *slot = Some(Arc::new(link));
        Ok(())
    }

    fn ensure_current(&self, epoch: u64) -> Result<()> {
        if self.inner.epoch.is_current(epoch) {
            Ok(())
        } else {
            Err(PuckError::Cancelled)
        }
    }

    async fn handshake_at(&self, station: &StationId, epoch: u64) -> Result<HandshakeResult> {
        self.ensure_current(epoch)?;
        let link = self.current_link().await?;
        self.inner.set_state(epoch, ConnectionState::Handshaking);

        let timeout_ms = self.inner.timeouts.handshake_timeout_ms;
        let outcome = self
            .guarded(
                epoch,
                perform_handshake(&*link, station, Duration::from_millis(timeout_ms)),
            )
            .await;

        let result = match outcome {
            Err(PuckError::WriteFailed(reason)) => {
                if link.is_connected().await {
                    return Err(PuckError::WriteFailed(reason));
                }
                debug!("Handshake write failed on a dropped link: {reason}");
                return Err(PuckError::GattDisconnected);
            }
            other => other?,
        };

        match result {
            HandshakeResult::Authenticated { reconciled_count } => {
                if let Some(count) = reconciled_count {
                    self.inner.telemetry.write().await.reconcile(count);
                }
                Ok(result)
            }
            HandshakeResult::Rejected => Err(PuckError::HandshakeRejected {
                station: station.to_string(),
            }),
            HandshakeResult::TimedOut => Err(PuckError::HandshakeTimeout { timeout_ms }),
        }
    }

    async fn subscribe_at(&self, epoch: u64) -> Result<()> {
        self.ensure_current(epoch)?;
        let link = self.current_link().await?;
        let notifications = link.notifications().await?;

        let timeout_ms = self.inner.timeouts.subscribe_timeout_ms;
        self.guarded(epoch, async {
            timeout(Duration::from_millis(timeout_ms), link.subscribe(GattChannel::Tx))
                .await
                .unwrap_or_else(|_| {
                    Err(PuckError::ConnectionFailed(format!(
                        "subscribe timed out after {timeout_ms}ms"
                    )))
                })
        })
        .await?;

        self.inner.set_state(epoch, ConnectionState::Subscribed);
        debug!("Subscribed to telemetry on {}", link.device_id());

        let weak = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(pump_notifications(Weak::clone(&weak), epoch, notifications));
        let watchdog = tokio::spawn(watch_link(weak, epoch, link));
        self.inner.tasks.lock().await.extend([pump, watchdog]);
        Ok(())
    }
}

/// Decode and forward notifications one at a time, in arrival order
async fn pump_notifications<C: PuckCentral>(
    inner: Weak<Inner<C>>,
    epoch: u64,
    mut notifications: NotificationStream,
) {
    while let Some(notification) = notifications.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.epoch.is_current(epoch) {
            return;
        }
        if notification.channel != GattChannel::Tx {
            continue;
        }

        debug!("Received: {:02X?}", notification.value);
        let event = inner
            .telemetry
            .write()
            .await
            .process(&notification.value, Instant::now());

        if let Some(event) = event {
            inner.state.send_if_modified(|state| {
                let first = *state == ConnectionState::Subscribed;
                if first {
                    *state = ConnectionState::Streaming;
                }
                first
            });
            inner.emit(PuckEvent::Telemetry(event));
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner
            .link_lost(epoch, LinkLossReason::NotificationsEnded)
            .await;
    }
}

/// Declare the link dead when the stack reports it or it falls silent
async fn watch_link<C: PuckCentral>(inner: Weak<Inner<C>>, epoch: u64, link: Arc<C::Link>) {
    let Some(timeouts) = inner.upgrade().map(|inner| inner.timeouts.clone()) else {
        return;
    };
    let heartbeat_timeout = Duration::from_millis(timeouts.heartbeat_timeout_ms);
    let since = Instant::now();
    let mut interval = tokio::time::interval(Duration::from_millis(timeouts.watchdog_interval_ms));

    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.epoch.is_current(epoch) {
            return;
        }

        let reason = if !link.is_connected().await {
            Some(LinkLossReason::Disconnected)
        } else if inner
            .telemetry
            .read()
            .await
            .is_silent(since, Instant::now(), heartbeat_timeout)
        {
            Some(LinkLossReason::Silent)
        } else {
            None
        };

        if let Some(reason) = reason {
            inner.link_lost(epoch, reason).await;
            return;
        }
    }
}
