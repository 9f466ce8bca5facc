//! In-memory radio back-ends.
//!
//! These stand in for the Bluetooth adapters and the ANT stick so the link
//! state machines and the coordinator can run on a desktop or in CI.
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockCentral`] | [`CentralRadio`] | Hands out [`MockDevice`]s to discovery |
//! | [`MockDevice`] | [`RemoteDevice`] | Scripted treadmill: push notifications, drop the link, fail writes |
//! | [`MockPeripheralRadio`] | [`PeripheralRadio`] | Records notifications, simulates a companion |
//! | [`MockAntStick`] | [`AntPort`] | Answers configuration and raises transmit events |
//!
//! Every mock is cheap to clone and clones share state, so a test keeps one
//! handle for scripting and inspection and gives another to the link.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    stream::{self, BoxStream},
    SinkExt, StreamExt,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc, Notify},
    time::MissedTickBehavior,
};
use tokio_util::codec::Framed;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    ant::{
        AntCodec, AntIo, AntMessage, AntPort, EVENT_CHANNEL_CLOSED, EVENT_QUE_OVERFLOW, EVENT_TX,
        MSG_BROADCAST_DATA, MSG_CHANNEL_EVENT, MSG_CLOSE_CHANNEL, MSG_OPEN_CHANNEL,
        MSG_RESET_SYSTEM, MSG_STARTUP, RESPONSE_NO_ERROR, RF_EVENT,
    },
    ble::{CentralRadio, CharacteristicFlags, GattCharacteristic, GattService, Notification, RemoteDevice},
    companion::{GattProfile, GattServer, GattServerHandle, PeripheralEvent, PeripheralRadio},
    error::{BridgeError, Result},
    CONTROL_POINT_UUID, FEATURE_UUID, FTMS_SERVICE_UUID, INCLINE_RANGE_UUID, MACHINE_STATUS_UUID,
    SPEED_RANGE_UUID, TRAINING_STATUS_UUID, TREADMILL_DATA_UUID,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn broadcast_stream<T: Clone + Send + 'static>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(value) => return Some((value, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

// ============================================================================
// Central role
// ============================================================================

struct DeviceInner {
    address: String,
    name: Option<String>,
    services: Vec<GattService>,
    notifications: broadcast::Sender<Notification>,
    link_loss: broadcast::Sender<()>,
    fail_writes: AtomicBool,
    writes: Mutex<Vec<Bytes>>,
    subscriptions: Mutex<Vec<Uuid>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

/// Scripted remote treadmill
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<DeviceInner>,
}

impl MockDevice {
    /// A treadmill exposing the usual FTMS characteristics
    #[must_use]
    pub fn treadmill(address: &str) -> Self {
        let characteristic = |uuid, flags| GattCharacteristic { uuid, flags };
        let read = CharacteristicFlags {
            read: true,
            ..CharacteristicFlags::default()
        };
        let notify = CharacteristicFlags {
            notify: true,
            ..CharacteristicFlags::default()
        };
        let service = GattService {
            uuid: FTMS_SERVICE_UUID,
            characteristics: vec![
                characteristic(FEATURE_UUID, read),
                characteristic(TREADMILL_DATA_UUID, notify),
                characteristic(SPEED_RANGE_UUID, read),
                characteristic(INCLINE_RANGE_UUID, read),
                characteristic(MACHINE_STATUS_UUID, notify),
                characteristic(
                    TRAINING_STATUS_UUID,
                    CharacteristicFlags {
                        read: true,
                        notify: true,
                        ..CharacteristicFlags::default()
                    },
                ),
                characteristic(
                    CONTROL_POINT_UUID,
                    CharacteristicFlags {
                        write: true,
                        indicate: true,
                        ..CharacteristicFlags::default()
                    },
                ),
            ],
        };
        Self::with_services(address, vec![service])
    }

    /// A device exposing exactly `services`
    #[must_use]
    pub fn with_services(address: &str, services: Vec<GattService>) -> Self {
        let (notifications, _) = broadcast::channel(64);
        let (link_loss, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(DeviceInner {
                address: address.to_string(),
                name: Some("Mock Treadmill".to_string()),
                services,
                notifications,
                link_loss,
                fail_writes: AtomicBool::new(false),
                writes: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
            }),
        }
    }

    /// Push a value as if the treadmill notified it
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) {
        let _ = self.inner.notifications.send(Notification {
            uuid: characteristic,
            value: Bytes::copy_from_slice(value),
        });
    }

    /// Simulate the radio losing the link
    pub fn drop_link(&self) {
        let _ = self.inner.link_loss.send(());
    }

    /// Make subsequent control point writes fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Control point writes accepted so far
    #[must_use]
    pub fn control_writes(&self) -> Vec<Bytes> {
        lock(&self.inner.writes).clone()
    }

    /// Characteristics notifications were enabled on
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Uuid> {
        lock(&self.inner.subscriptions).clone()
    }

    /// Number of `connect` calls
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.inner
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .any(|c| c.uuid == uuid)
    }
}

#[async_trait]
impl RemoteDevice for MockDevice {
    fn address(&self) -> String {
        self.inner.address.clone()
    }

    fn name(&self) -> Option<String> {
        self.inner.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        Ok(self.inner.services.clone())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        if !self.has_characteristic(characteristic) {
            return Err(BridgeError::CharacteristicNotFound(characteristic));
        }
        lock(&self.inner.subscriptions).push(characteristic);
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        if !self.has_characteristic(characteristic) {
            return Err(BridgeError::CharacteristicNotFound(characteristic));
        }
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(BridgeError::Other("GATT write failed".to_string()));
        }
        lock(&self.inner.writes).push(Bytes::copy_from_slice(value));
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
        Ok(broadcast_stream(self.inner.notifications.subscribe()))
    }

    async fn disconnections(&self) -> Result<BoxStream<'static, ()>> {
        Ok(broadcast_stream(self.inner.link_loss.subscribe()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Central radio that "discovers" the devices it was given
#[derive(Default)]
pub struct MockCentral {
    devices: Mutex<Vec<MockDevice>>,
    discovers: AtomicUsize,
}

impl MockCentral {
    /// A radio with nothing in range
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring a device into range
    pub fn add_device(&self, device: MockDevice) {
        lock(&self.devices).push(device);
    }

    /// Take every device out of range
    pub fn clear_devices(&self) {
        lock(&self.devices).clear();
    }

    /// Number of discovery runs
    #[must_use]
    pub fn discover_count(&self) -> usize {
        self.discovers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CentralRadio for MockCentral {
    async fn discover(
        &self,
        timeout: Duration,
        blacklist: Option<&str>,
    ) -> Result<Option<Box<dyn RemoteDevice>>> {
        self.discovers.fetch_add(1, Ordering::SeqCst);
        let found = lock(&self.devices)
            .iter()
            .find(|d| !blacklist.is_some_and(|b| b.eq_ignore_ascii_case(&d.inner.address)))
            .cloned();
        match found {
            Some(device) => Ok(Some(Box::new(device))),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }
}

// ============================================================================
// Peripheral role
// ============================================================================

struct PeripheralInner {
    address: String,
    fail_publish: AtomicBool,
    publishes: AtomicUsize,
    resumes: AtomicUsize,
    shutdowns: AtomicUsize,
    notifications: Mutex<Vec<(Uuid, Bytes)>>,
    profile: Mutex<Option<GattProfile>>,
    events: Mutex<Option<mpsc::Sender<PeripheralEvent>>>,
}

/// Peripheral radio that records what it serves
#[derive(Clone)]
pub struct MockPeripheralRadio {
    inner: Arc<PeripheralInner>,
}

impl MockPeripheralRadio {
    /// A radio whose adapter has `address`
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            inner: Arc::new(PeripheralInner {
                address: address.to_string(),
                fail_publish: AtomicBool::new(false),
                publishes: AtomicUsize::new(0),
                resumes: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                notifications: Mutex::new(Vec::new()),
                profile: Mutex::new(None),
                events: Mutex::new(None),
            }),
        }
    }

    /// Make subsequent `publish` calls fail (or succeed again)
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    fn send(&self, event: PeripheralEvent) {
        if let Some(events) = lock(&self.inner.events).as_ref() {
            if let Err(e) = events.try_send(event) {
                debug!("Mock peripheral event dropped: {e}");
            }
        }
    }

    /// Simulate a companion connecting
    pub fn connect_companion(&self) {
        self.send(PeripheralEvent::Connected);
    }

    /// Simulate the companion going away
    pub fn disconnect_companion(&self) {
        self.send(PeripheralEvent::Disconnected);
    }

    /// Simulate the companion writing to the control point
    pub fn write_control(&self, value: &[u8]) {
        self.send(PeripheralEvent::ControlWrite(Bytes::copy_from_slice(value)));
    }

    /// Simulate the GATT server dying underneath the link
    pub fn kill_server(&self) {
        lock(&self.inner.events).take();
    }

    /// Every value notified so far, in order
    #[must_use]
    pub fn notifications(&self) -> Vec<(Uuid, Bytes)> {
        lock(&self.inner.notifications).clone()
    }

    /// Values notified on one characteristic, in order
    #[must_use]
    pub fn notifications_for(&self, characteristic: Uuid) -> Vec<Bytes> {
        lock(&self.inner.notifications)
            .iter()
            .filter(|(uuid, _)| *uuid == characteristic)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Profile passed to the most recent `publish`
    #[must_use]
    pub fn last_profile(&self) -> Option<GattProfile> {
        lock(&self.inner.profile).clone()
    }

    /// Number of successful `publish` calls
    #[must_use]
    pub fn publish_count(&self) -> usize {
        self.inner.publishes.load(Ordering::SeqCst)
    }

    /// Number of `resume_advertising` calls
    #[must_use]
    pub fn resume_count(&self) -> usize {
        self.inner.resumes.load(Ordering::SeqCst)
    }

    /// Number of `shutdown` calls
    #[must_use]
    pub fn shutdown_count(&self) -> usize {
        self.inner.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeripheralRadio for MockPeripheralRadio {
    async fn publish(&self, profile: &GattProfile) -> Result<GattServerHandle> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(BridgeError::Companion("advertising refused".to_string()));
        }
        let (events_tx, events) = mpsc::channel(32);
        *lock(&self.inner.events) = Some(events_tx);
        *lock(&self.inner.profile) = Some(profile.clone());
        self.inner.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(GattServerHandle {
            events,
            server: Box::new(MockGattServer {
                inner: Arc::clone(&self.inner),
            }),
        })
    }

    async fn local_address(&self) -> Result<String> {
        Ok(self.inner.address.clone())
    }
}

struct MockGattServer {
    inner: Arc<PeripheralInner>,
}

#[async_trait]
impl GattServer for MockGattServer {
    async fn notify(&self, characteristic: Uuid, value: Bytes) -> Result<()> {
        lock(&self.inner.notifications).push((characteristic, value));
        Ok(())
    }

    async fn resume_advertising(&self) -> Result<()> {
        self.inner.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdowns.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.events).take();
        Ok(())
    }
}

// ============================================================================
// ANT+
// ============================================================================

struct StickInner {
    tx_period: Duration,
    fail_open: AtomicBool,
    opens: AtomicUsize,
    broadcasts: Mutex<Vec<[u8; 8]>>,
    commands: Mutex<Vec<u8>>,
    overflow: Notify,
}

/// ANT stick simulated over an in-memory pipe
///
/// Acknowledges every command, answers a reset with a startup message and,
/// once the channel is open, raises a transmit event every `tx_period`.
#[derive(Clone)]
pub struct MockAntStick {
    inner: Arc<StickInner>,
}

impl MockAntStick {
    /// A stick raising transmit events every `tx_period`
    #[must_use]
    pub fn new(tx_period: Duration) -> Self {
        Self {
            inner: Arc::new(StickInner {
                tx_period,
                fail_open: AtomicBool::new(false),
                opens: AtomicUsize::new(0),
                broadcasts: Mutex::new(Vec::new()),
                commands: Mutex::new(Vec::new()),
                overflow: Notify::new(),
            }),
        }
    }

    /// Make subsequent `open` calls fail (or succeed again)
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Report a transmit queue overflow on the open channel
    pub fn inject_overflow(&self) {
        self.inner.overflow.notify_one();
    }

    /// Number of successful `open` calls
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Datapages broadcast so far, in order
    #[must_use]
    pub fn broadcasts(&self) -> Vec<[u8; 8]> {
        lock(&self.inner.broadcasts).clone()
    }

    /// Message ids of every command received, broadcasts excluded
    #[must_use]
    pub fn commands(&self) -> Vec<u8> {
        lock(&self.inner.commands).clone()
    }
}

#[async_trait]
impl AntPort for MockAntStick {
    async fn open(&self) -> Result<Box<dyn AntIo>> {
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(BridgeError::Ant("no stick attached".to_string()));
        }
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        let (host, stick) = tokio::io::duplex(1024);
        tokio::spawn(respond(Arc::clone(&self.inner), Framed::new(stick, AntCodec)));
        Ok(Box::new(host))
    }
}

fn rf_event(channel: u8, code: u8) -> AntMessage {
    AntMessage::new(MSG_CHANNEL_EVENT, &[channel, RF_EVENT, code])
}

async fn respond(inner: Arc<StickInner>, mut framed: Framed<tokio::io::DuplexStream, AntCodec>) {
    let mut ticker = tokio::time::interval(inner.tx_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut open_channel: Option<u8> = None;

    loop {
        let reply = tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(message)) => handle_command(&inner, &message, &mut open_channel),
                Some(Err(e)) => {
                    debug!("Mock stick decode error: {e}");
                    None
                }
                None => break,
            },
            _ = ticker.tick(), if open_channel.is_some() => {
                open_channel.map(|channel| rf_event(channel, EVENT_TX))
            }
            () = inner.overflow.notified(), if open_channel.is_some() => {
                open_channel.map(|channel| rf_event(channel, EVENT_QUE_OVERFLOW))
            }
        };

        if let Some(reply) = reply {
            if framed.send(reply).await.is_err() {
                break;
            }
        }
    }
    trace!("Mock stick connection closed");
}

fn handle_command(
    inner: &StickInner,
    message: &AntMessage,
    open_channel: &mut Option<u8>,
) -> Option<AntMessage> {
    let channel = message.payload.first().copied().unwrap_or_default();
    match message.id {
        MSG_BROADCAST_DATA => {
            if let Ok(page) = <[u8; 8]>::try_from(message.payload.get(1..9).unwrap_or_default()) {
                lock(&inner.broadcasts).push(page);
            }
            None
        }
        MSG_RESET_SYSTEM => {
            lock(&inner.commands).push(message.id);
            *open_channel = None;
            Some(AntMessage::new(MSG_STARTUP, &[0x00]))
        }
        MSG_CLOSE_CHANNEL => {
            lock(&inner.commands).push(message.id);
            *open_channel = None;
            Some(rf_event(channel, EVENT_CHANNEL_CLOSED))
        }
        id => {
            lock(&inner.commands).push(id);
            if id == MSG_OPEN_CHANNEL {
                *open_channel = Some(channel);
            }
            Some(AntMessage::new(MSG_CHANNEL_EVENT, &[channel, id, RESPONSE_NO_ERROR]))
        }
    }
}
