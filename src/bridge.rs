//! The coordinator owns the three links and routes events between them.
//!
//! ```text
//!   treadmill ──Sample──► companion cache ──► companion (every 500 ms)
//!       │          └────► ANT+ inputs ─────► ANT+ channel (every TX event)
//!       │          └────► presentation (Telemetry)
//!       ▲
//!       └── control point ◄── companion writes (verbatim)
//!                         ◄── presentation commands
//! ```
//!
//! Presentation code holds an [`FtmsBridge`], sends commands through it and
//! listens to [`BridgeEvent`]s. Everything else happens in one spawned task.

use bytes::Bytes;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ant::{AntEvent, AntLink, AntPort},
    ble::{CentralRadio, TreadmillEvent, TreadmillLink},
    companion::{CacheUpdate, CompanionCache, CompanionEvent, CompanionLink, PeripheralRadio},
    datapage::AntInputs,
    error::{BridgeError, Result},
    ftms::{ControlCommand, StopKind},
    types::{
        AdapterMode, BridgeConfig, CompanionState, MachineStatus, Telemetry, TrainingStatus,
        TreadmillSample,
    },
};

/// Speed step used by [`FtmsBridge::adjust_speed`], in 0.01 km/h
pub const SPEED_STEP: i32 = 20;

/// Incline step used by [`FtmsBridge::adjust_incline`], in 0.1 %
pub const INCLINE_STEP: i32 = 5;

/// Radio back-ends handed to the bridge
pub struct BridgeRadios {
    /// Central role, talks to the treadmill
    pub central: Arc<dyn CentralRadio>,
    /// Peripheral role, serves the companion; only used in
    /// [`AdapterMode::ClientPlusServer`]
    pub peripheral: Option<Arc<dyn PeripheralRadio>>,
    /// ANT stick; no ANT+ broadcast without one
    pub ant: Option<Arc<dyn AntPort>>,
}

impl BridgeRadios {
    /// Only talk to the treadmill
    #[must_use]
    pub fn central_only(central: Arc<dyn CentralRadio>) -> Self {
        Self {
            central,
            peripheral: None,
            ant: None,
        }
    }

    /// Add a peripheral radio for the companion
    #[must_use]
    pub fn with_peripheral(mut self, peripheral: Arc<dyn PeripheralRadio>) -> Self {
        self.peripheral = Some(peripheral);
        self
    }

    /// Add an ANT stick
    #[must_use]
    pub fn with_ant(mut self, ant: Arc<dyn AntPort>) -> Self {
        self.ant = Some(ant);
        self
    }
}

/// Events for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Display-ready view of the latest sample
    Telemetry(Telemetry),
    /// Latest decoded sample
    Sample(TreadmillSample),
    /// Latest machine status
    MachineStatus(MachineStatus),
    /// Latest training status
    TrainingStatus(TrainingStatus),
    /// Treadmill connected (subscribed) or lost
    TreadmillConnection(bool),
    /// Companion connected or lost
    CompanionConnection(bool),
    /// Status line
    Diagnostic(String),
}

#[derive(Debug)]
enum Request {
    Command(ControlCommand),
    AdjustSpeed(i32),
    AdjustIncline(i32),
    StartPause,
    StopWorkout,
    Reconnect,
}

/// Handle to a running bridge
pub struct FtmsBridge {
    events: broadcast::Sender<BridgeEvent>,
    requests: mpsc::Sender<Request>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FtmsBridge {
    /// Spawn the coordinator and start looking for the treadmill
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(config: BridgeConfig, radios: BridgeRadios) -> Self {
        let (events, _) = broadcast::channel(512);
        let (requests_tx, requests) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        let coordinator = Coordinator::new(config, radios, events.clone(), requests, cancel.clone());
        let task = tokio::spawn(coordinator.run());

        Self {
            events,
            requests: requests_tx,
            cancel,
            task: Some(task),
        }
    }

    /// Subscribe to bridge events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.requests.send(request).await.map_err(|_| BridgeError::NotReady {
            reason: "bridge stopped".to_string(),
        })
    }

    /// Send a control point command to the treadmill
    ///
    /// Dropped silently while the treadmill is not subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] if the bridge has been stopped.
    pub async fn send_command(&self, command: ControlCommand) -> Result<()> {
        self.request(Request::Command(command)).await
    }

    /// Set the belt speed
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidParameters`] if `kmh` is negative or
    /// not representable, or [`BridgeError::NotReady`] if the bridge stopped.
    pub async fn set_speed_kmh(&self, kmh: f64) -> Result<()> {
        let centi = (kmh * 100.0).round();
        if !(0.0..=f64::from(u16::MAX)).contains(&centi) {
            return Err(BridgeError::InvalidParameters(format!("speed {kmh} km/h")));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let speed = centi as u16;
        self.send_command(ControlCommand::SetTargetSpeed(speed)).await
    }

    /// Set the belt speed from a pace per kilometer written as `M:SS`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidParameters`] if `pace` does not parse
    /// or is too fast to encode, or [`BridgeError::NotReady`] if the bridge
    /// stopped.
    pub async fn set_pace(&self, pace: &str) -> Result<()> {
        let speed = pace_to_speed(pace)?;
        self.send_command(ControlCommand::SetTargetSpeed(speed)).await
    }

    /// Set the incline in percent
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidParameters`] if `percent` is out of
    /// range, or [`BridgeError::NotReady`] if the bridge stopped.
    pub async fn set_incline_percent(&self, percent: f64) -> Result<()> {
        let deci = (percent * 10.0).round();
        if !(f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&deci) {
            return Err(BridgeError::InvalidParameters(format!("incline {percent}%")));
        }
        #[allow(clippy::cast_possible_truncation)]
        let incline = deci as i16;
        self.send_command(ControlCommand::SetTargetIncline(incline)).await
    }

    /// Change the speed by `steps` × 0.2 km/h relative to the latest sample
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] if the bridge stopped.
    pub async fn adjust_speed(&self, steps: i32) -> Result<()> {
        self.request(Request::AdjustSpeed(steps.saturating_mul(SPEED_STEP))).await
    }

    /// Change the incline by `steps` × 0.5 % relative to the latest sample
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] if the bridge stopped.
    pub async fn adjust_incline(&self, steps: i32) -> Result<()> {
        self.request(Request::AdjustIncline(steps.saturating_mul(INCLINE_STEP))).await
    }

    /// Start the belt, or pause it if it was started from here
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] if the bridge stopped.
    pub async fn start_pause(&self) -> Result<()> {
        self.request(Request::StartPause).await
    }

    /// End the workout: pause, take control, reset, take control again
    ///
    /// The commands are spaced by the configured stop sequence gap.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] if the bridge stopped.
    pub async fn stop_workout(&self) -> Result<()> {
        self.request(Request::StopWorkout).await
    }

    /// Look for the treadmill again after a failed reconnect
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] if the bridge stopped.
    pub async fn reconnect(&self) -> Result<()> {
        self.request(Request::Reconnect).await
    }

    /// Stop every link and wait for the coordinator to exit; safe to call
    /// repeatedly
    pub async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Bridge coordinator ended abnormally: {e}");
            }
            info!("Bridge stopped");
        }
    }
}

impl Drop for FtmsBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Convert a pace per kilometer (`M:SS`) to a target speed in 0.01 km/h
///
/// # Errors
///
/// Returns [`BridgeError::InvalidParameters`] if the text does not parse,
/// the seconds are not below 60, the pace is zero, or the resulting speed
/// does not fit the control point field.
pub fn pace_to_speed(pace: &str) -> Result<u16> {
    let invalid = || BridgeError::InvalidParameters(format!("pace {pace:?}"));
    let (minutes, seconds) = pace.trim().split_once(':').ok_or_else(invalid)?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    let seconds: u32 = seconds.parse().map_err(|_| invalid())?;
    if seconds >= 60 {
        return Err(invalid());
    }
    let total = minutes
        .checked_mul(60)
        .and_then(|m| m.checked_add(seconds))
        .filter(|&total| total > 0)
        .ok_or_else(invalid)?;
    u16::try_from(360_000 / total).map_err(|_| invalid())
}

/// The control point sequence sent by [`FtmsBridge::stop_workout`]
#[must_use]
pub const fn stop_sequence() -> [ControlCommand; 4] {
    [
        ControlCommand::Stop(StopKind::Pause),
        ControlCommand::RequestControl,
        ControlCommand::Reset,
        ControlCommand::RequestControl,
    ]
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_event<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> std::result::Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn received<T>(result: std::result::Result<T, RecvError>, link: &str) -> Option<T> {
    match result {
        Ok(event) => Some(event),
        Err(RecvError::Lagged(missed)) => {
            warn!("Missed {missed} {link} events");
            None
        }
        Err(RecvError::Closed) => None,
    }
}

struct Coordinator {
    config: BridgeConfig,
    radios: BridgeRadios,
    events: broadcast::Sender<BridgeEvent>,
    requests: mpsc::Receiver<Request>,
    cancel: CancellationToken,

    treadmill: TreadmillLink,
    treadmill_rx: broadcast::Receiver<TreadmillEvent>,
    blacklist: Option<String>,
    treadmill_connected: bool,
    retrying: bool,
    reconnect_at: Option<Instant>,

    companion: Option<CompanionLink>,
    companion_rx: Option<broadcast::Receiver<CompanionEvent>>,
    rebuild_at: Option<Instant>,

    ant: Option<AntLink>,
    ant_rx: Option<broadcast::Receiver<AntEvent>>,
    ant_inputs: watch::Sender<AntInputs>,
    session: u64,

    cache: CompanionCache,
    running: bool,
    staged: VecDeque<ControlCommand>,
    staged_at: Option<Instant>,
}

impl Coordinator {
    fn new(
        config: BridgeConfig,
        radios: BridgeRadios,
        events: broadcast::Sender<BridgeEvent>,
        requests: mpsc::Receiver<Request>,
        cancel: CancellationToken,
    ) -> Self {
        let treadmill = TreadmillLink::new(config.treadmill.clone());
        let treadmill_rx = treadmill.subscribe();
        let (ant_inputs, _) = watch::channel(AntInputs::default());
        Self {
            config,
            radios,
            events,
            requests,
            cancel,
            treadmill,
            treadmill_rx,
            blacklist: None,
            treadmill_connected: false,
            retrying: false,
            reconnect_at: None,
            companion: None,
            companion_rx: None,
            rebuild_at: None,
            ant: None,
            ant_rx: None,
            ant_inputs,
            session: 0,
            cache: CompanionCache::default(),
            running: false,
            staged: VecDeque::new(),
            staged_at: None,
        }
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn diagnostic(&self, text: impl Into<String>) {
        self.emit(BridgeEvent::Diagnostic(text.into()));
    }

    const fn serves_companion(&self) -> bool {
        matches!(self.config.mode, AdapterMode::ClientPlusServer { .. })
    }

    async fn run(mut self) {
        info!("Bridge starting in {:?}", self.config.mode);

        if self.serves_companion() {
            match &self.radios.peripheral {
                Some(peripheral) => match peripheral.local_address().await {
                    Ok(address) => {
                        debug!("Ignoring our own companion adapter {address} during discovery");
                        self.blacklist = Some(address);
                    }
                    Err(e) => warn!("Could not read companion adapter address: {e}"),
                },
                None => {
                    warn!("Companion mode configured without a peripheral radio");
                    self.diagnostic("No peripheral radio, companion disabled");
                }
            }
        }

        if let Some(port) = self.radios.ant.clone() {
            let link = AntLink::start(port, self.config.ant.clone(), self.ant_inputs.subscribe());
            self.ant_rx = Some(link.subscribe());
            self.ant = Some(link);
        } else {
            info!("No ANT stick configured, ANT+ broadcast disabled");
        }

        self.connect_treadmill().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                event = self.treadmill_rx.recv() => {
                    if let Some(event) = received(event, "treadmill") {
                        self.handle_treadmill(event).await;
                    }
                }
                event = next_event(&mut self.companion_rx) => {
                    if let Some(event) = received(event, "companion") {
                        self.handle_companion(event).await;
                    }
                }
                event = next_event(&mut self.ant_rx) => {
                    if let Some(event) = received(event, "ANT+") {
                        self.handle_ant(event);
                    }
                }
                () = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    info!("Reconnecting to treadmill");
                    self.connect_treadmill().await;
                }
                () = wait_until(self.rebuild_at) => {
                    self.rebuild_at = None;
                    self.rebuild_companion().await;
                }
                () = wait_until(self.staged_at) => self.send_staged().await,
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        info!("Bridge shutting down");
        self.staged.clear();
        if let Some(mut companion) = self.companion.take() {
            companion.stop().await;
        }
        if let Some(mut ant) = self.ant.take() {
            ant.stop().await;
        }
        self.treadmill.disconnect().await;
    }

    async fn connect_treadmill(&mut self) {
        let central = Arc::clone(&self.radios.central);
        self.treadmill.connect(central, self.blacklist.clone()).await;
    }

    async fn send(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Start => self.running = true,
            ControlCommand::Stop(_) => self.running = false,
            _ => {}
        }
        if let Err(e) = self.treadmill.send_command(command).await {
            warn!("Command {command} not sent: {e}");
        }
    }

    async fn send_staged(&mut self) {
        match self.staged.pop_front() {
            Some(command) => {
                self.send(command).await;
                self.staged_at = (!self.staged.is_empty())
                    .then(|| Instant::now() + Duration::from_millis(self.config.timing.stop_sequence_gap_ms));
            }
            None => self.staged_at = None,
        }
    }

    async fn handle_request(&mut self, request: Request) {
        debug!("Presentation request {request:?}");
        match request {
            Request::Command(command) => self.send(command).await,
            Request::AdjustSpeed(delta) => {
                let current = i32::from(self.cache.sample.instantaneous_speed.unwrap_or(0));
                let target = (current + delta).clamp(0, i32::from(u16::MAX));
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let target = target as u16;
                self.send(ControlCommand::SetTargetSpeed(target)).await;
            }
            Request::AdjustIncline(delta) => {
                let current = i32::from(self.cache.sample.inclination.unwrap_or(0));
                let target = (current + delta).clamp(i32::from(i16::MIN), i32::from(i16::MAX));
                #[allow(clippy::cast_possible_truncation)]
                let target = target as i16;
                self.send(ControlCommand::SetTargetIncline(target)).await;
            }
            Request::StartPause => {
                let command = if self.running {
                    ControlCommand::Stop(StopKind::Pause)
                } else {
                    ControlCommand::Start
                };
                self.send(command).await;
            }
            Request::StopWorkout => {
                self.staged = stop_sequence().into();
                self.send_staged().await;
            }
            Request::Reconnect => {
                // the link we tear down reports a disconnect we asked for
                self.treadmill_connected = false;
                self.reconnect_at = None;
                self.retrying = false;
                self.diagnostic("Looking for treadmill");
                self.connect_treadmill().await;
            }
        }
    }

    async fn handle_treadmill(&mut self, event: TreadmillEvent) {
        match event {
            TreadmillEvent::Sample(sample) => {
                self.ant_inputs.send_modify(|inputs| {
                    if let Some(speed) = sample.speed_mps() {
                        inputs.speed_mps = speed;
                    }
                    if let Some(distance) = sample.total_distance {
                        inputs.distance_m = Some(f64::from(distance));
                    }
                    if let Some(calories) = sample.calories() {
                        inputs.calories = Some(calories);
                    }
                });
                self.update_cache(CacheUpdate::Sample(sample));
                self.emit(BridgeEvent::Telemetry(Telemetry::from(&sample)));
                self.emit(BridgeEvent::Sample(sample));
            }
            TreadmillEvent::Status(status) => {
                self.update_cache(CacheUpdate::Status(status.clone()));
                self.emit(BridgeEvent::MachineStatus(status));
            }
            TreadmillEvent::TrainingStatus(training) => {
                self.update_cache(CacheUpdate::Training(training.clone()));
                self.emit(BridgeEvent::TrainingStatus(training));
            }
            TreadmillEvent::ConnectionChanged(true) => {
                self.treadmill_connected = true;
                self.retrying = false;
                self.session += 1;
                let session = self.session;
                self.ant_inputs.send_modify(|inputs| {
                    inputs.session = session;
                    inputs.distance_m = None;
                    inputs.calories = None;
                });
                self.emit(BridgeEvent::TreadmillConnection(true));
                self.diagnostic("Treadmill connected");
                if self.companion.is_none() {
                    self.start_companion().await;
                }
            }
            TreadmillEvent::ConnectionChanged(false) => {
                self.emit(BridgeEvent::TreadmillConnection(false));
                if self.treadmill_connected {
                    self.treadmill_connected = false;
                    self.retrying = true;
                    let delay = self.config.timing.reconnect_delay_ms;
                    warn!("Treadmill lost, reconnecting in {delay}ms");
                    self.diagnostic(format!("Treadmill connection lost, reconnecting in {delay}ms"));
                    self.reconnect_at = Some(Instant::now() + Duration::from_millis(delay));
                } else if self.retrying {
                    self.retrying = false;
                    error!("Treadmill reconnect failed");
                    self.diagnostic("Reconnect failed, waiting for manual reconnect");
                }
            }
            TreadmillEvent::Diagnostic(text) => self.diagnostic(text),
            TreadmillEvent::StateChanged(state) => debug!("Treadmill link is {state}"),
        }
    }

    fn update_cache(&mut self, update: CacheUpdate) {
        if let Some(companion) = &self.companion {
            companion.update_cache(update.clone());
        }
        self.cache.apply(update);
    }

    async fn start_companion(&mut self) {
        if !self.serves_companion() {
            return;
        }
        let Some(radio) = self.radios.peripheral.clone() else {
            return;
        };

        let companion = self
            .companion
            .get_or_insert_with(|| CompanionLink::new(self.config.companion.clone()));
        companion.stop().await;
        self.companion_rx = Some(companion.subscribe());

        match companion.start(radio, self.cache.clone()).await {
            Ok(()) => self.diagnostic("Companion advertising"),
            Err(e) => {
                error!("Companion failed to start: {e}");
                self.diagnostic(format!("Companion failed to start: {e}"));
                self.schedule_rebuild();
            }
        }
    }

    fn schedule_rebuild(&mut self) {
        if self.rebuild_at.is_none() {
            let delay = Duration::from_millis(self.config.timing.companion_rebuild_delay_ms);
            self.rebuild_at = Some(Instant::now() + delay);
        }
    }

    async fn rebuild_companion(&mut self) {
        info!("Rebuilding companion link");
        self.start_companion().await;
    }

    async fn handle_companion(&mut self, event: CompanionEvent) {
        match event {
            CompanionEvent::ControlWriteReceived(value) => self.relay(value).await,
            CompanionEvent::ConnectionChanged(connected) => {
                self.emit(BridgeEvent::CompanionConnection(connected));
                if connected {
                    self.diagnostic("Companion connected");
                } else {
                    self.diagnostic("Companion disconnected");
                    self.schedule_rebuild();
                }
            }
            CompanionEvent::StateChanged(state) => {
                debug!("Companion link is {state}");
                if state == CompanionState::Stopped {
                    self.schedule_rebuild();
                }
            }
            CompanionEvent::Diagnostic(text) => self.diagnostic(text),
        }
    }

    async fn relay(&self, value: Bytes) {
        debug!("Relaying companion write {:02X?}", value.as_ref());
        if let Err(e) = self.treadmill.send_raw(value).await {
            warn!("Companion write not relayed: {e}");
        }
    }

    fn handle_ant(&self, event: AntEvent) {
        match event {
            AntEvent::ChannelOpened => self.diagnostic("ANT+ broadcasting"),
            AntEvent::TransmitOverflow => self.diagnostic("ANT+ transmit overflow, restarting channel"),
            AntEvent::ChannelClosed => self.diagnostic("ANT+ channel closed"),
            AntEvent::Diagnostic(text) => self.diagnostic(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pace_to_speed() {
        assert_eq!(pace_to_speed("5:00").unwrap(), 1200);
        assert_eq!(pace_to_speed("6:00").unwrap(), 1000);
        assert_eq!(pace_to_speed(" 4:30 ").unwrap(), 1333);
        assert_eq!(pace_to_speed("10:00").unwrap(), 600);
    }

    #[test]
    fn test_pace_to_speed_rejects_garbage() {
        assert!(pace_to_speed("5").is_err());
        assert!(pace_to_speed("a:00").is_err());
        assert!(pace_to_speed("5:75").is_err());
        assert!(pace_to_speed("0:00").is_err());
        assert!(pace_to_speed("0:05").is_err());
        assert!(pace_to_speed("71582789:00").is_err());
        assert!(pace_to_speed("71582788:59").is_err());
    }

    #[test]
    fn test_stop_sequence_bytes() {
        let bytes: Vec<Bytes> = stop_sequence()
            .into_iter()
            .map(crate::ftms::encode_control_point)
            .collect();
        assert_eq!(
            bytes,
            vec![
                Bytes::from_static(&[0x08, 0x02]),
                Bytes::from_static(&[0x00]),
                Bytes::from_static(&[0x01]),
                Bytes::from_static(&[0x00]),
            ]
        );
    }

    #[test]
    fn test_central_only_radios() {
        let radios = BridgeRadios::central_only(Arc::new(crate::mock::MockCentral::new()));
        assert!(radios.peripheral.is_none());
        assert!(radios.ant.is_none());
    }
}
