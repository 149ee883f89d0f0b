//! Peripheral-side session state machine.
//!
//! [`PuckSession`] is the authoritative owner of a Puck's session state. It is
//! a plain value driven by explicit inputs (writes, samples, button presses,
//! NFC taps, clock ticks) with the current time passed in, and it answers with
//! the [`Outbound`] messages the peripheral must send. Nothing here touches a
//! radio, so any number of sessions can run side by side in one process.
//!
//! ```text
//!   Idle ──calibrate──▶ Calibrating ──N samples──▶ Armed ──start/NFC/press──▶ Active
//!    ▲                                                                        │
//!    └──────────────── reset / long press ◀── Stopped ◀──stop/press/timeout───┘
//! ```
//!
//! Button semantics: a short press toggles (Idle → Calibrating,
//! Armed → Active, Active → Stopped), a press held for at least
//! [`SessionConfig::long_press_ms`] resets from any state.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    protocol::{CommandId, ErrorCode, Packet, HANDSHAKE_MISMATCH, HANDSHAKE_OK},
    types::{SessionConfig, SessionState, StationId, STATION_ID_LEN},
};

/// Message the peripheral must send as a result of an input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Handshake verdict, notified on or read back from RX
    HandshakeResponse(Vec<u8>),
    /// Telemetry packet notified on TX
    Telemetry(Packet),
}

/// Why the link went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The central closed the link on purpose
    Explicit,
    /// The radio link dropped
    LinkLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    Disconnected,
    Connected,
    Authenticated,
}

/// Turns raw sensor samples into debounced repetition events
///
/// A sample is motion when it deviates from the calibrated baseline by at
/// least the threshold. A motion event only counts when more than the
/// cooldown has passed since the previous counted one; a single physical
/// repetition can cross the threshold several times and must count once.
#[derive(Debug, Clone)]
pub struct MotionDetector {
    baseline: Option<f32>,
    threshold: f32,
    cooldown: Duration,
    last_counted: Option<Instant>,
}

impl MotionDetector {
    /// Create an uncalibrated detector
    #[must_use]
    pub const fn new(threshold: f32, cooldown: Duration) -> Self {
        Self {
            baseline: None,
            threshold,
            cooldown,
            last_counted: None,
        }
    }

    /// Calibrated baseline
    #[must_use]
    pub const fn baseline(&self) -> Option<f32> {
        self.baseline
    }

    /// Install a baseline
    pub fn set_baseline(&mut self, baseline: f32) {
        self.baseline = Some(baseline);
        self.last_counted = None;
    }

    /// Forget the baseline and debounce history
    pub fn clear(&mut self) {
        self.baseline = None;
        self.last_counted = None;
    }

    /// Check if a sample deviates enough from the baseline
    #[must_use]
    pub fn is_motion(&self, sample: f32) -> bool {
        self.baseline
            .is_some_and(|baseline| (sample - baseline).abs() >= self.threshold)
    }

    /// Debounce an event at `now`, returning whether it counts
    pub fn accept(&mut self, now: Instant) -> bool {
        let counts = self
            .last_counted
            .is_none_or(|last| now.saturating_duration_since(last) > self.cooldown);

        if counts {
            self.last_counted = Some(now);
        }
        counts
    }
}

/// One Puck's session
#[derive(Debug)]
pub struct PuckSession {
    station: StationId,
    config: SessionConfig,
    state: SessionState,
    count: u8,
    battery_pct: u8,
    detector: MotionDetector,
    calibration: Vec<f32>,
    session_started: Option<Instant>,
    last_heartbeat: Option<Instant>,
    link: LinkPhase,
    subscribed: bool,
}

impl PuckSession {
    /// Create an idle session for the Puck paired with `station`
    #[must_use]
    pub fn new(station: StationId, config: SessionConfig) -> Self {
        let detector = MotionDetector::new(config.motion_threshold, config.cooldown());
        Self {
            station,
            config,
            state: SessionState::Idle,
            count: 0,
            battery_pct: 100,
            detector,
            calibration: Vec::new(),
            session_started: None,
            last_heartbeat: None,
            link: LinkPhase::Disconnected,
            subscribed: false,
        }
    }

    /// Station this Puck is paired with
    #[must_use]
    pub const fn station(&self) -> &StationId {
        &self.station
    }

    /// Current session state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Cumulative repetition count
    #[must_use]
    pub const fn count(&self) -> u8 {
        self.count
    }

    /// Battery level in percent
    #[must_use]
    pub const fn battery_pct(&self) -> u8 {
        self.battery_pct
    }

    /// Check if a central has passed the handshake on the current link
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.link == LinkPhase::Authenticated
    }

    /// Check if telemetry currently reaches a central
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.is_authenticated() && self.subscribed
    }

    /// Calibrated baseline
    #[must_use]
    pub const fn baseline(&self) -> Option<f32> {
        self.detector.baseline()
    }

    /// Update the battery level reported in STATUS and HEARTBEAT
    pub fn set_battery(&mut self, battery_pct: u8) {
        self.battery_pct = battery_pct.min(100);
    }

    /// Snapshot of the session as a STATUS packet
    #[must_use]
    pub fn status_packet(&self) -> Packet {
        Packet::status(
            self.state == SessionState::Active,
            self.count,
            self.battery_pct,
            self.detector.baseline().is_some(),
        )
    }

    /// Power-on: start calibrating straight away
    pub fn boot(&mut self) -> Vec<Outbound> {
        info!("Puck for station {} booting", self.station);
        let mut out = Vec::new();
        if self.state == SessionState::Idle {
            self.begin_calibration(&mut out);
        }
        out
    }

    /// A central connected
    pub fn on_connect(&mut self) {
        debug!("Central connected");
        self.link = LinkPhase::Connected;
        self.subscribed = false;
    }

    /// The central went away
    ///
    /// An explicit disconnect ends an active session; a lost link does not,
    /// so reps keep counting and are reported on the next handshake.
    pub fn on_disconnect(&mut self, reason: DisconnectReason) {
        info!("Central disconnected ({reason:?}) in state {}", self.state);
        self.link = LinkPhase::Disconnected;
        self.subscribed = false;
        self.last_heartbeat = None;

        if reason == DisconnectReason::Explicit && self.state == SessionState::Active {
            let mut out = Vec::new();
            self.stop("central disconnected", &mut out);
        }
    }

    /// The central enabled TX notifications
    pub fn on_subscribed(&mut self, now: Instant) -> Vec<Outbound> {
        self.subscribed = true;
        let mut out = Vec::new();
        if self.is_authenticated() {
            self.announce(now, &mut out);
        }
        out
    }

    /// A value was written to RX
    pub fn on_write(&mut self, data: &[u8], now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        if let Some(token) = handshake_token(data) {
            if !self.is_authenticated() || data.len() == STATION_ID_LEN + 1 {
                self.handshake(token, now, &mut out);
                return out;
            }
        }

        if !self.is_authenticated() {
            warn!("Ignoring {:02X?} from unauthenticated central", data);
            self.emit(Packet::error(ErrorCode::NotAuthenticated), &mut out);
            return out;
        }

        let Some((&command, args)) = data.split_first() else {
            self.emit(Packet::error(ErrorCode::MalformedCommand), &mut out);
            return out;
        };

        match CommandId::try_from(command) {
            Ok(command) if args.is_empty() => self.apply_command(command, now, &mut out),
            Ok(command) => {
                warn!("Command {command} carries unexpected arguments {:02X?}", args);
                self.emit(Packet::error(ErrorCode::MalformedCommand), &mut out);
            }
            Err(unknown) => {
                warn!("Unknown command {unknown:#04X}");
                self.emit(Packet::error(ErrorCode::UnknownCommand), &mut out);
            }
        }

        out
    }

    /// A raw sensor sample arrived
    pub fn on_sample(&mut self, sample: f32, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        match self.state {
            SessionState::Calibrating => {
                self.calibration.push(sample);
                if self.calibration.len() >= self.config.calibration_sample_count.max(1) {
                    self.finish_calibration(&mut out);
                }
            }
            SessionState::Active if self.detector.is_motion(sample) => {
                out = self.on_motion(now);
            }
            _ => {}
        }
        out
    }

    /// A discrete motion event was detected
    pub fn on_motion(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        self.check_auto_stop(now, &mut out);

        if self.state != SessionState::Active {
            return out;
        }

        if !self.detector.accept(now) {
            debug!("Motion inside cooldown window, not counted");
            return out;
        }

        self.count = self.count.wrapping_add(1);
        if self.count == 0 {
            warn!("Rep counter wrapped past 255");
        }
        debug!("Rep {} counted", self.count);
        self.emit(Packet::rep_count(self.count), &mut out);
        out
    }

    /// The physical button was released after being held for `held`
    pub fn on_button(&mut self, held: Duration, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        if held >= self.config.long_press() {
            info!("Long press: resetting session");
            self.reset(&mut out);
            return out;
        }

        match self.state {
            SessionState::Idle => self.begin_calibration(&mut out),
            SessionState::Armed => self.start(now, "button", &mut out),
            SessionState::Active => self.stop("button", &mut out),
            SessionState::Calibrating | SessionState::Stopped => {
                debug!("Short press ignored in state {}", self.state);
            }
        }
        out
    }

    /// The station's NFC tag was tapped
    pub fn on_nfc_trigger(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        match self.state {
            SessionState::Armed => self.start(now, "NFC tap", &mut out),
            SessionState::Active => debug!("NFC tap during active session ignored"),
            state => warn!("NFC tap ignored in state {state}"),
        }
        out
    }

    /// Clock tick: auto-stop and heartbeats
    pub fn tick(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        self.check_auto_stop(now, &mut out);

        if self.is_streaming() {
            let due = self.last_heartbeat.is_none_or(|last| {
                now.saturating_duration_since(last) >= self.config.heartbeat_interval()
            });
            if due {
                self.last_heartbeat = Some(now);
                self.emit(Packet::heartbeat(self.battery_pct), &mut out);
            }
        }
        out
    }

    fn handshake(&mut self, token: &[u8], now: Instant, out: &mut Vec<Outbound>) {
        if token == self.station.as_bytes() {
            info!("Handshake accepted for station {}", self.station);
            let was_authenticated = self.is_authenticated();
            self.link = LinkPhase::Authenticated;
            out.push(Outbound::HandshakeResponse(vec![HANDSHAKE_OK, self.count]));
            if self.subscribed && !was_authenticated {
                self.announce(now, out);
            }
        } else {
            warn!(
                "Handshake rejected: got {:02X?}, paired with {}",
                token, self.station
            );
            out.push(Outbound::HandshakeResponse(vec![HANDSHAKE_MISMATCH]));
        }
    }

    fn announce(&mut self, now: Instant, out: &mut Vec<Outbound>) {
        self.last_heartbeat = Some(now);
        self.emit(Packet::handshake_ack(self.count), out);
        self.emit_status(out);
    }

    fn apply_command(&mut self, command: CommandId, now: Instant, out: &mut Vec<Outbound>) {
        debug!("Command {command} in state {}", self.state);
        self.check_auto_stop(now, out);

        match (command, self.state) {
            (CommandId::Handshake, _) => {
                self.emit(Packet::error(ErrorCode::MalformedCommand), out);
            }
            (CommandId::StartSession, SessionState::Armed) => self.start(now, "command", out),
            (CommandId::StartSession, SessionState::Idle | SessionState::Calibrating) => {
                self.emit(Packet::error(ErrorCode::NotCalibrated), out);
            }
            (CommandId::StopSession, SessionState::Active) => self.stop("command", out),
            (CommandId::Calibrate, SessionState::Idle | SessionState::Armed) => {
                self.begin_calibration(out);
            }
            (CommandId::Reset, state) if state != SessionState::Active => self.reset(out),
            (command, state) => {
                warn!("Command {command} not valid in state {state}");
                self.emit(Packet::error(ErrorCode::InvalidState), out);
            }
        }
    }

    fn begin_calibration(&mut self, out: &mut Vec<Outbound>) {
        info!(
            "Calibrating over {} samples",
            self.config.calibration_sample_count
        );
        self.detector.clear();
        self.calibration.clear();
        self.transition(SessionState::Calibrating, out);
    }

    fn finish_calibration(&mut self, out: &mut Vec<Outbound>) {
        #[allow(clippy::cast_precision_loss)]
        let baseline = self.calibration.iter().sum::<f32>() / self.calibration.len() as f32;
        info!("Calibration complete, baseline {baseline:.3}");
        self.detector.set_baseline(baseline);
        self.calibration.clear();
        self.transition(SessionState::Armed, out);
    }

    fn start(&mut self, now: Instant, trigger: &str, out: &mut Vec<Outbound>) {
        info!("Session started by {trigger}");
        self.count = 0;
        self.session_started = Some(now);
        self.transition(SessionState::Active, out);
    }

    fn stop(&mut self, trigger: &str, out: &mut Vec<Outbound>) {
        info!("Session stopped by {trigger} at {} reps", self.count);
        self.session_started = None;
        self.transition(SessionState::Stopped, out);
    }

    fn reset(&mut self, out: &mut Vec<Outbound>) {
        self.count = 0;
        self.session_started = None;
        self.detector.clear();
        self.calibration.clear();
        self.transition(SessionState::Idle, out);
    }

    fn check_auto_stop(&mut self, now: Instant, out: &mut Vec<Outbound>) {
        if self.state != SessionState::Active {
            return;
        }
        let expired = self.session_started.is_some_and(|started| {
            now.saturating_duration_since(started) >= self.config.auto_stop_timeout()
        });
        if expired {
            self.stop("auto-stop timeout", out);
        }
    }

    fn transition(&mut self, next: SessionState, out: &mut Vec<Outbound>) {
        if self.state != next {
            debug!("Session {} -> {}", self.state, next);
        }
        self.state = next;
        self.emit_status(out);
    }

    fn emit_status(&self, out: &mut Vec<Outbound>) {
        self.emit(self.status_packet(), out);
    }

    fn emit(&self, packet: Packet, out: &mut Vec<Outbound>) {
        if self.is_streaming() {
            out.push(Outbound::Telemetry(packet));
        }
    }
}

/// Station token carried by a handshake write, if `data` is one
///
/// Accepts the bare 8-byte token and the `[HANDSHAKE, token...]` command form.
fn handshake_token(data: &[u8]) -> Option<&[u8]> {
    match data.len() {
        STATION_ID_LEN => Some(data),
        len if len == STATION_ID_LEN + 1 && data[0] == CommandId::Handshake as u8 => {
            Some(&data[1..])
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::PacketType,
        telemetry::{decode_telemetry, TelemetryEvent},
    };

    const MS: Duration = Duration::from_millis(1);

    fn station() -> StationId {
        StationId::new("LEGEXT01").unwrap()
    }

    fn telemetry(out: &[Outbound]) -> Vec<TelemetryEvent> {
        out.iter()
            .filter_map(|o| match o {
                Outbound::Telemetry(packet) => {
                    Some(decode_telemetry(&packet.to_bytes().unwrap()).unwrap())
                }
                Outbound::HandshakeResponse(_) => None,
            })
            .collect()
    }

    /// Session that is calibrated (baseline 1.0), authenticated and subscribed
    fn armed_session(config: SessionConfig, t0: Instant) -> PuckSession {
        let mut session = PuckSession::new(station(), config);
        session.boot();
        for _ in 0..session.config.calibration_sample_count {
            session.on_sample(1.0, t0);
        }
        assert_eq!(session.state(), SessionState::Armed);

        session.on_connect();
        session.on_write(b"LEGEXT01", t0);
        session.on_subscribed(t0);
        session
    }

    #[test]
    fn test_debounce_rejects_double_trigger() {
        let t0 = Instant::now();
        let mut detector = MotionDetector::new(0.5, Duration::from_millis(500));

        assert!(detector.accept(t0));
        assert!(!detector.accept(t0 + 300 * MS));
        assert!(detector.accept(t0 + 900 * MS));
    }

    #[test]
    fn test_motion_threshold() {
        let mut detector = MotionDetector::new(0.5, Duration::from_millis(500));
        assert!(!detector.is_motion(10.0));

        detector.set_baseline(1.0);
        assert!(!detector.is_motion(1.2));
        assert!(detector.is_motion(1.6));
        assert!(detector.is_motion(0.4));
    }

    #[test]
    fn test_calibration_sets_baseline_and_arms() {
        let t0 = Instant::now();
        let config = SessionConfig {
            calibration_sample_count: 4,
            ..SessionConfig::default()
        };
        let mut session = PuckSession::new(station(), config);

        session.boot();
        assert_eq!(session.state(), SessionState::Calibrating);

        for sample in [1.0, 2.0, 3.0] {
            session.on_sample(sample, t0);
        }
        assert_eq!(session.state(), SessionState::Calibrating);

        session.on_sample(6.0, t0);
        assert_eq!(session.state(), SessionState::Armed);
        assert_eq!(session.baseline(), Some(3.0));
    }

    #[test]
    fn test_reps_inside_cooldown_count_once() {
        let t0 = Instant::now();
        let mut session = armed_session(SessionConfig::default(), t0);
        session.on_write(&[CommandId::StartSession as u8], t0);

        session.on_motion(t0 + 100 * MS);
        session.on_motion(t0 + 400 * MS);
        assert_eq!(session.count(), 1);

        session.on_motion(t0 + 700 * MS);
        assert_eq!(session.count(), 2);
    }

    #[test]
    fn test_samples_drive_rep_count_packets() {
        let t0 = Instant::now();
        let mut session = armed_session(SessionConfig::default(), t0);
        session.on_write(&[CommandId::StartSession as u8], t0);

        assert!(session.on_sample(1.1, t0 + 50 * MS).is_empty());
        let out = session.on_sample(2.0, t0 + 100 * MS);
        assert_eq!(telemetry(&out), vec![TelemetryEvent::RepCount { count: 1 }]);
    }

    #[test]
    fn test_start_resets_counter() {
        let t0 = Instant::now();
        let mut session = armed_session(SessionConfig::default(), t0);
        session.on_write(&[CommandId::StartSession as u8], t0);
        session.on_motion(t0 + 100 * MS);
        session.on_write(&[CommandId::StopSession as u8], t0 + 200 * MS);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.count(), 1);

        session.on_write(&[CommandId::Reset as u8], t0 + 300 * MS);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.count(), 0);
        assert_eq!(session.baseline(), None);
    }

    #[test]
    fn test_auto_stop_emits_inactive_status() {
        let t0 = Instant::now();
        let config = SessionConfig {
            auto_stop_timeout_ms: 30_000,
            ..SessionConfig::default()
        };
        let mut session = armed_session(config, t0);
        session.on_write(&[CommandId::StartSession as u8], t0);
        session.on_motion(t0 + 1_000 * MS);

        assert!(telemetry(&session.tick(t0 + 29_000 * MS))
            .iter()
            .all(|e| !matches!(e, TelemetryEvent::Status(_))));
        assert_eq!(session.state(), SessionState::Active);

        let events = telemetry(&session.tick(t0 + 30_001 * MS));
        assert_eq!(session.state(), SessionState::Stopped);
        let status = events
            .iter()
            .find_map(|e| match e {
                TelemetryEvent::Status(status) => Some(*status),
                _ => None,
            })
            .unwrap();
        assert!(!status.active);
        assert_eq!(status.count, 1);
    }

    #[test]
    fn test_reps_while_disconnected_are_reported_on_reconnect() {
        let t0 = Instant::now();
        let mut session = armed_session(SessionConfig::default(), t0);
        session.on_write(&[CommandId::StartSession as u8], t0);
        session.on_motion(t0 + 100 * MS);

        session.on_disconnect(DisconnectReason::LinkLoss);
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.on_motion(t0 + 1_000 * MS).is_empty());
        assert!(session.on_motion(t0 + 2_000 * MS).is_empty());
        assert_eq!(session.count(), 3);

        session.on_connect();
        let out = session.on_write(b"LEGEXT01", t0 + 3_000 * MS);
        assert_eq!(out, vec![Outbound::HandshakeResponse(vec![HANDSHAKE_OK, 3])]);

        let events = telemetry(&session.on_subscribed(t0 + 3_100 * MS));
        assert_eq!(events[0], TelemetryEvent::HandshakeAck { count: 3 });
    }

    #[test]
    fn test_explicit_disconnect_stops_active_session() {
        let t0 = Instant::now();
        let mut session = armed_session(SessionConfig::default(), t0);
        session.on_write(&[CommandId::StartSession as u8], t0);

        session.on_disconnect(DisconnectReason::Explicit);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_wrong_token_is_rejected() {
        let t0 = Instant::now();
        let mut session = PuckSession::new(station(), SessionConfig::default());
        session.on_connect();

        let out = session.on_write(b"CHEST002", t0);
        assert_eq!(out, vec![Outbound::HandshakeResponse(vec![HANDSHAKE_MISMATCH])]);
        assert!(!session.is_authenticated());

        let out = session.on_write(&[0x01, b'L', b'E', b'G', b'E', b'X', b'T', b'0', b'1'], t0);
        assert_eq!(out, vec![Outbound::HandshakeResponse(vec![HANDSHAKE_OK, 0])]);
        assert!(session.is_authenticated());
    }

    #[test]
    fn test_commands_require_authentication() {
        let t0 = Instant::now();
        let mut session = PuckSession::new(station(), SessionConfig::default());
        session.boot();
        session.on_connect();
        session.on_subscribed(t0);

        assert!(session.on_write(&[CommandId::Calibrate as u8], t0).is_empty());
        assert_eq!(session.state(), SessionState::Calibrating);
    }

    #[test]
    fn test_invalid_commands_report_errors() {
        let t0 = Instant::now();
        let mut session = armed_session(SessionConfig::default(), t0);

        let events = telemetry(&session.on_write(&[CommandId::StopSession as u8], t0));
        assert_eq!(
            events,
            vec![TelemetryEvent::Error {
                code: ErrorCode::InvalidState
            }]
        );

        let events = telemetry(&session.on_write(&[0x09], t0));
        assert_eq!(
            events,
            vec![TelemetryEvent::Error {
                code: ErrorCode::UnknownCommand
            }]
        );
        assert_eq!(session.state(), SessionState::Armed);
    }

    #[test]
    fn test_button_toggle_and_long_press_reset() {
        let t0 = Instant::now();
        let mut session = armed_session(SessionConfig::default(), t0);

        session.on_button(100 * MS, t0);
        assert_eq!(session.state(), SessionState::Active);

        session.on_motion(t0 + 100 * MS);
        session.on_button(100 * MS, t0 + 200 * MS);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.count(), 1);

        session.on_button(100 * MS, t0 + 300 * MS);
        assert_eq!(session.state(), SessionState::Stopped);

        session.on_button(2_000 * MS, t0 + 400 * MS);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.count(), 0);

        session.on_button(100 * MS, t0 + 500 * MS);
        assert_eq!(session.state(), SessionState::Calibrating);
    }

    #[test]
    fn test_nfc_trigger_starts_without_central_command() {
        let t0 = Instant::now();
        let mut session = armed_session(SessionConfig::default(), t0);

        let out = session.on_nfc_trigger(t0);
        assert_eq!(session.state(), SessionState::Active);
        let packet = match &out[0] {
            Outbound::Telemetry(packet) => packet.clone(),
            Outbound::HandshakeResponse(_) => panic!("unexpected handshake response"),
        };
        assert_eq!(packet.kind().unwrap(), PacketType::Status);
        assert_eq!(packet.payload[0], 1);
    }

    #[test]
    fn test_heartbeat_cadence() {
        let t0 = Instant::now();
        let mut session = armed_session(SessionConfig::default(), t0);
        session.set_battery(77);

        assert!(session.tick(t0 + 1_000 * MS).is_empty());
        let events = telemetry(&session.tick(t0 + 5_000 * MS));
        assert_eq!(events, vec![TelemetryEvent::Heartbeat { battery_pct: 77 }]);
        assert!(session.tick(t0 + 6_000 * MS).is_empty());
    }

    #[test]
    fn test_counter_wraps_after_255() {
        let t0 = Instant::now();
        let config = SessionConfig {
            cooldown_ms: 0,
            auto_stop_timeout_ms: u64::MAX / 2,
            ..SessionConfig::default()
        };
        let mut session = armed_session(config, t0);
        session.on_write(&[CommandId::StartSession as u8], t0);

        for i in 1..=256 {
            session.on_motion(t0 + Duration::from_millis(i));
        }
        assert_eq!(session.count(), 0);
    }
}
