//! Companion link: re-expose the treadmill as a BLE peripheral.
//!
//! The link publishes a Device Information service and a clone of the FTMS
//! service, keeps a cache of the latest treadmill values and pushes all three
//! notifying characteristics to a connected companion on a fixed interval,
//! whether or not they changed. Control point writes from the companion are
//! surfaced as events; the coordinator decides where they go.

use async_trait::async_trait;
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    ble::CharacteristicFlags,
    error::Result,
    ftms,
    types::{CompanionConfig, CompanionState, MachineStatus, TrainingStatus, TreadmillSample},
    CONTROL_POINT_UUID, DEVICE_INFORMATION_UUID, FEATURE_UUID, FIRMWARE_REVISION_UUID,
    FTMS_SERVICE_UUID, HARDWARE_REVISION_UUID, INCLINE_RANGE_UUID, MACHINE_STATUS_UUID,
    MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID, SERIAL_NUMBER_UUID, SOFTWARE_REVISION_UUID,
    SPEED_RANGE_UUID, TRAINING_STATUS_UUID, TREADMILL_DATA_UUID,
};

/// A characteristic the peripheral serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Capabilities
    pub flags: CharacteristicFlags,
    /// Initial value returned to reads
    pub value: Bytes,
}

impl LocalCharacteristic {
    fn read_only(uuid: Uuid, value: Bytes) -> Self {
        Self {
            uuid,
            flags: CharacteristicFlags {
                read: true,
                ..CharacteristicFlags::default()
            },
            value,
        }
    }
}

/// A primary service the peripheral serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalService {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics of this service
    pub characteristics: Vec<LocalCharacteristic>,
}

/// Everything a peripheral back-end needs to publish and advertise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    /// Advertised local name
    pub local_name: String,
    /// Service UUIDs listed in the advertisement
    pub advertised_services: Vec<Uuid>,
    /// Services to register
    pub services: Vec<LocalService>,
}

impl GattProfile {
    /// Look up a characteristic by UUID across all services
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&LocalCharacteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == uuid)
    }
}

/// Build the companion profile: Device Information plus the FTMS clone,
/// seeded from `cache`
#[must_use]
pub fn companion_profile(config: &CompanionConfig, cache: &CompanionCache) -> GattProfile {
    let text = |s: &str| Bytes::copy_from_slice(s.as_bytes());
    let device_information = LocalService {
        uuid: DEVICE_INFORMATION_UUID,
        characteristics: vec![
            LocalCharacteristic::read_only(MANUFACTURER_NAME_UUID, text(&config.manufacturer)),
            LocalCharacteristic::read_only(MODEL_NUMBER_UUID, text(&config.model_number)),
            LocalCharacteristic::read_only(SERIAL_NUMBER_UUID, text(&config.serial_number)),
            LocalCharacteristic::read_only(HARDWARE_REVISION_UUID, text(&config.hardware_revision)),
            LocalCharacteristic::read_only(FIRMWARE_REVISION_UUID, text(&config.firmware_revision)),
            LocalCharacteristic::read_only(SOFTWARE_REVISION_UUID, text(&config.software_revision)),
        ],
    };

    let notify = CharacteristicFlags {
        notify: true,
        ..CharacteristicFlags::default()
    };
    let fitness_machine = LocalService {
        uuid: FTMS_SERVICE_UUID,
        characteristics: vec![
            LocalCharacteristic::read_only(
                FEATURE_UUID,
                ftms::encode_feature(
                    ftms::COMPANION_MACHINE_FEATURES,
                    ftms::COMPANION_TARGET_FEATURES,
                ),
            ),
            LocalCharacteristic {
                uuid: TREADMILL_DATA_UUID,
                flags: notify,
                value: ftms::encode_treadmill_data(&cache.sample),
            },
            LocalCharacteristic::read_only(SPEED_RANGE_UUID, ftms::encode_speed_range(100, 1600, 10)),
            LocalCharacteristic::read_only(INCLINE_RANGE_UUID, ftms::encode_incline_range(0, 100, 5)),
            LocalCharacteristic {
                uuid: MACHINE_STATUS_UUID,
                flags: notify,
                value: cache.status.as_bytes().clone(),
            },
            LocalCharacteristic {
                uuid: TRAINING_STATUS_UUID,
                flags: CharacteristicFlags {
                    read: true,
                    notify: true,
                    ..CharacteristicFlags::default()
                },
                value: cache.training.as_bytes().clone(),
            },
            LocalCharacteristic {
                uuid: CONTROL_POINT_UUID,
                flags: CharacteristicFlags {
                    write: true,
                    ..CharacteristicFlags::default()
                },
                value: Bytes::from_static(&[0x00]),
            },
        ],
    };

    GattProfile {
        local_name: config.local_name.clone(),
        advertised_services: vec![DEVICE_INFORMATION_UUID, FTMS_SERVICE_UUID],
        services: vec![device_information, fitness_machine],
    }
}

/// Radio-level events from a published GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    /// A companion connected
    Connected,
    /// The companion went away
    Disconnected,
    /// The companion wrote to the control point
    ControlWrite(Bytes),
}

/// A published GATT server
#[async_trait]
pub trait GattServer: Send + Sync {
    /// Push a value to subscribers and make it the value returned to reads
    ///
    /// # Errors
    ///
    /// Returns an error if the notification could not be delivered.
    async fn notify(&self, characteristic: Uuid, value: Bytes) -> Result<()>;

    /// Advertise again after a companion left
    ///
    /// # Errors
    ///
    /// Returns an error if advertising cannot be restarted.
    async fn resume_advertising(&self) -> Result<()>;

    /// Stop advertising and unregister the services
    ///
    /// # Errors
    ///
    /// Returns an error if the back-end fails to tear down.
    async fn shutdown(&self) -> Result<()>;
}

/// A published server plus the event queue it feeds
pub struct GattServerHandle {
    /// Connection and write events
    pub events: mpsc::Receiver<PeripheralEvent>,
    /// The server itself
    pub server: Box<dyn GattServer>,
}

/// BLE radio able to act as a peripheral
#[async_trait]
pub trait PeripheralRadio: Send + Sync {
    /// Register `profile` and start advertising
    ///
    /// # Errors
    ///
    /// Returns an error if registration or advertising fails.
    async fn publish(&self, profile: &GattProfile) -> Result<GattServerHandle>;

    /// Address of the adapter serving the peripheral
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter cannot be queried.
    async fn local_address(&self) -> Result<String>;
}

/// Latest values served to the companion
#[derive(Debug, Clone, PartialEq)]
pub struct CompanionCache {
    /// Last treadmill data sample
    pub sample: TreadmillSample,
    /// Last machine status
    pub status: MachineStatus,
    /// Last training status
    pub training: TrainingStatus,
}

impl Default for CompanionCache {
    fn default() -> Self {
        Self {
            sample: TreadmillSample::idle(),
            status: MachineStatus::idle(),
            training: TrainingStatus::idle(),
        }
    }
}

impl CompanionCache {
    /// Fold an update into the cache
    pub fn apply(&mut self, update: CacheUpdate) {
        match update {
            CacheUpdate::Sample(sample) => self.sample = sample,
            CacheUpdate::Status(status) => self.status = status,
            CacheUpdate::Training(training) => self.training = training,
        }
    }
}

/// One new value for the companion cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// New treadmill data
    Sample(TreadmillSample),
    /// New machine status
    Status(MachineStatus),
    /// New training status
    Training(TrainingStatus),
}

/// Events published by the companion link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanionEvent {
    /// Advertising state machine moved
    StateChanged(CompanionState),
    /// The companion wrote these bytes to the control point
    ControlWriteReceived(Bytes),
    /// Companion connected or lost
    ConnectionChanged(bool),
    /// Free-text status line
    Diagnostic(String),
}

/// BLE peripheral link serving a companion device
pub struct CompanionLink {
    config: CompanionConfig,
    events: broadcast::Sender<CompanionEvent>,
    state: Arc<watch::Sender<CompanionState>>,
    updates: Option<mpsc::UnboundedSender<CacheUpdate>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CompanionLink {
    /// Create a stopped link
    #[must_use]
    pub fn new(config: CompanionConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (state, _) = watch::channel(CompanionState::Stopped);
        Self {
            config,
            events,
            state: Arc::new(state),
            updates: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Subscribe to link events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CompanionEvent> {
        self.events.subscribe()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CompanionState {
        *self.state.borrow()
    }

    /// Publish the services, start advertising and serve `seed` until
    /// fresher values arrive
    ///
    /// A running link is stopped first.
    ///
    /// # Errors
    ///
    /// Returns an error if the radio refuses to publish the profile; the
    /// link stays [`CompanionState::Stopped`].
    pub async fn start(&mut self, radio: Arc<dyn PeripheralRadio>, seed: CompanionCache) -> Result<()> {
        self.stop().await;

        let profile = companion_profile(&self.config, &seed);
        let handle = radio.publish(&profile).await?;
        info!("Companion advertising as {}", profile.local_name);

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        self.cancel = CancellationToken::new();
        self.updates = Some(updates_tx);

        let server = Server {
            interval: Duration::from_millis(self.config.notify_interval_ms.max(1)),
            cache: seed,
            handle,
            updates: updates_rx,
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
        };
        server.set_state(CompanionState::Advertising);
        self.task = Some(tokio::spawn(server.run()));
        Ok(())
    }

    /// Replace one cached value; ignored while stopped
    pub fn update_cache(&self, update: CacheUpdate) {
        if let Some(updates) = &self.updates {
            let _ = updates.send(update);
        }
    }

    /// Stop advertising, unregister the services and wait for the task
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.updates = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Companion task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for CompanionLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Server {
    interval: Duration,
    cache: CompanionCache,
    handle: GattServerHandle,
    updates: mpsc::UnboundedReceiver<CacheUpdate>,
    events: broadcast::Sender<CompanionEvent>,
    state: Arc<watch::Sender<CompanionState>>,
    cancel: CancellationToken,
}

impl Server {
    fn emit(&self, event: CompanionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: CompanionState) {
        if self.state.send_replace(state) != state {
            info!("Companion link: {state}");
            self.emit(CompanionEvent::StateChanged(state));
        }
    }

    async fn push_cache(&self) {
        let values = [
            (TREADMILL_DATA_UUID, ftms::encode_treadmill_data(&self.cache.sample)),
            (MACHINE_STATUS_UUID, self.cache.status.as_bytes().clone()),
            (TRAINING_STATUS_UUID, self.cache.training.as_bytes().clone()),
        ];
        for (uuid, value) in values {
            if let Err(e) = self.handle.server.notify(uuid, value).await {
                debug!("Companion notify on {uuid} failed: {e}");
            }
        }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut connected = false;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                update = self.updates.recv() => match update {
                    Some(update) => self.cache.apply(update),
                    None => break,
                },
                event = self.handle.events.recv() => match event {
                    Some(PeripheralEvent::Connected) => {
                        if !connected {
                            connected = true;
                            self.set_state(CompanionState::Connected);
                            self.emit(CompanionEvent::ConnectionChanged(true));
                            self.push_cache().await;
                        }
                    }
                    Some(PeripheralEvent::Disconnected) => {
                        if connected {
                            connected = false;
                            warn!("Companion disconnected");
                            self.set_state(CompanionState::Advertising);
                            self.emit(CompanionEvent::ConnectionChanged(false));
                            if let Err(e) = self.handle.server.resume_advertising().await {
                                warn!("Failed to resume advertising: {e}");
                                self.emit(CompanionEvent::Diagnostic(format!(
                                    "Companion advertising failed: {e}"
                                )));
                            }
                        }
                    }
                    Some(PeripheralEvent::ControlWrite(value)) => {
                        debug!("Companion control write {:02X?}", value.as_ref());
                        self.emit(CompanionEvent::ControlWriteReceived(value));
                    }
                    None => {
                        warn!("Companion GATT server closed");
                        self.emit(CompanionEvent::Diagnostic(
                            "Companion GATT server closed".to_string(),
                        ));
                        if connected {
                            self.emit(CompanionEvent::ConnectionChanged(false));
                        }
                        break;
                    }
                },
                _ = ticker.tick(), if connected => self.push_cache().await,
            }
        }

        if let Err(e) = self.handle.server.shutdown().await {
            warn!("Companion shutdown failed: {e}");
        }
        self.set_state(CompanionState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPeripheralRadio;

    fn test_config() -> CompanionConfig {
        CompanionConfig {
            notify_interval_ms: 500,
            ..CompanionConfig::default()
        }
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<CompanionEvent>, pred: F) -> CompanionEvent
    where
        F: Fn(&CompanionEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received")
    }

    #[test]
    fn test_profile_layout() {
        let profile = companion_profile(&CompanionConfig::default(), &CompanionCache::default());
        assert_eq!(profile.local_name, "BLE_Bridge");
        assert_eq!(
            profile.advertised_services,
            vec![DEVICE_INFORMATION_UUID, FTMS_SERVICE_UUID]
        );

        let manufacturer = profile.characteristic(MANUFACTURER_NAME_UUID).unwrap();
        assert_eq!(manufacturer.value.as_ref(), b"BLE_Bridge");
        assert_eq!(profile.characteristic(MODEL_NUMBER_UUID).unwrap().value.as_ref(), b"2");

        let feature = profile.characteristic(FEATURE_UUID).unwrap();
        assert_eq!(feature.value.as_ref(), &[0x0D, 0x16, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00]);

        let data = profile.characteristic(TREADMILL_DATA_UUID).unwrap();
        assert!(data.flags.notify);
        assert_eq!(&data.value[..2], &[0x8C, 0x05]);

        let control = profile.characteristic(CONTROL_POINT_UUID).unwrap();
        assert!(control.flags.write);
        assert!(!control.flags.notify);

        let training = profile.characteristic(TRAINING_STATUS_UUID).unwrap();
        assert!(training.flags.read && training.flags.notify);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_pushed_every_interval_while_connected() {
        let radio = MockPeripheralRadio::new("00:11:22:33:44:55");
        let mut link = CompanionLink::new(test_config());
        let mut rx = link.subscribe();
        link.start(Arc::new(radio.clone()), CompanionCache::default()).await.unwrap();
        assert_eq!(link.state(), CompanionState::Advertising);

        // nothing is pushed while advertising
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(radio.notifications().is_empty());

        radio.connect_companion();
        next_matching(&mut rx, |e| *e == CompanionEvent::ConnectionChanged(true)).await;

        let sample = TreadmillSample {
            instantaneous_speed: Some(1000),
            ..TreadmillSample::idle()
        };
        link.update_cache(CacheUpdate::Sample(sample));
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let data = radio.notifications_for(TREADMILL_DATA_UUID);
        assert!(data.len() >= 3, "expected repeated pushes, got {}", data.len());
        assert_eq!(data.last().unwrap(), &ftms::encode_treadmill_data(&sample));
        assert!(!radio.notifications_for(MACHINE_STATUS_UUID).is_empty());
        assert!(!radio.notifications_for(TRAINING_STATUS_UUID).is_empty());

        link.stop().await;
        assert_eq!(link.state(), CompanionState::Stopped);
        assert_eq!(radio.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn test_control_write_forwarded() {
        let radio = MockPeripheralRadio::new("00:11:22:33:44:55");
        let mut link = CompanionLink::new(test_config());
        let mut rx = link.subscribe();
        link.start(Arc::new(radio.clone()), CompanionCache::default()).await.unwrap();

        radio.write_control(&[0x02, 0xE8, 0x03]);
        let event = next_matching(&mut rx, |e| matches!(e, CompanionEvent::ControlWriteReceived(_))).await;
        assert_eq!(
            event,
            CompanionEvent::ControlWriteReceived(Bytes::from_static(&[0x02, 0xE8, 0x03]))
        );
        link.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_resumes_advertising() {
        let radio = MockPeripheralRadio::new("00:11:22:33:44:55");
        let mut link = CompanionLink::new(test_config());
        let mut rx = link.subscribe();
        link.start(Arc::new(radio.clone()), CompanionCache::default()).await.unwrap();

        radio.connect_companion();
        next_matching(&mut rx, |e| *e == CompanionEvent::ConnectionChanged(true)).await;
        radio.disconnect_companion();
        next_matching(&mut rx, |e| *e == CompanionEvent::ConnectionChanged(false)).await;

        assert_eq!(link.state(), CompanionState::Advertising);
        assert_eq!(radio.resume_count(), 1);
        link.stop().await;
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_link_stopped() {
        let radio = MockPeripheralRadio::new("00:11:22:33:44:55");
        radio.set_fail_publish(true);
        let mut link = CompanionLink::new(test_config());
        assert!(link.start(Arc::new(radio), CompanionCache::default()).await.is_err());
        assert_eq!(link.state(), CompanionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let radio = MockPeripheralRadio::new("00:11:22:33:44:55");
        let mut link = CompanionLink::new(test_config());
        link.start(Arc::new(radio.clone()), CompanionCache::default()).await.unwrap();
        link.stop().await;
        link.stop().await;
        assert_eq!(radio.shutdown_count(), 1);
        assert_eq!(radio.publish_count(), 1);
    }
}
