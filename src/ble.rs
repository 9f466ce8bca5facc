use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{BridgeError, Result},
    ftms::{self, ControlCommand},
    types::{
        AdapterSelector, LinkState, MachineStatus, TrainingStatus, TreadmillLinkConfig,
        TreadmillSample,
    },
    CONTROL_POINT_UUID, FTMS_SERVICE_UUID, MACHINE_STATUS_UUID, TRAINING_STATUS_UUID,
    TREADMILL_DATA_UUID,
};

/// GATT characteristic capabilities relevant to the link
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicFlags {
    /// Readable
    pub read: bool,
    /// Writable with response
    pub write: bool,
    /// Writable without response
    pub write_without_response: bool,
    /// Supports notifications
    pub notify: bool,
    /// Supports indications
    pub indicate: bool,
}

impl CharacteristicFlags {
    /// Whether value changes can be pushed to us
    #[must_use]
    pub const fn can_notify(self) -> bool {
        self.notify || self.indicate
    }

    /// Whether the characteristic accepts writes
    #[must_use]
    pub const fn can_write(self) -> bool {
        self.write || self.write_without_response
    }
}

/// A characteristic exposed by a remote device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Capabilities
    pub flags: CharacteristicFlags,
}

/// A service exposed by a remote device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics of this service
    pub characteristics: Vec<GattCharacteristic>,
}

/// A value pushed by the remote device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic the value belongs to
    pub uuid: Uuid,
    /// Raw value
    pub value: Bytes,
}

/// BLE central radio able to find FTMS devices
#[async_trait]
pub trait CentralRadio: Send + Sync {
    /// Scan for the first device advertising FTMS whose address is not
    /// `blacklist`
    ///
    /// Returns `Ok(None)` when nothing matched within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the radio cannot scan.
    async fn discover(
        &self,
        timeout: Duration,
        blacklist: Option<&str>,
    ) -> Result<Option<Box<dyn RemoteDevice>>>;
}

/// A discovered remote peripheral
#[async_trait]
pub trait RemoteDevice: Send + Sync {
    /// Bluetooth address
    fn address(&self) -> String;

    /// Advertised local name
    fn name(&self) -> Option<String>;

    /// Open the link
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    async fn connect(&self) -> Result<()>;

    /// Discover and list the remote services
    ///
    /// # Errors
    ///
    /// Returns an error if service discovery fails.
    async fn discover_services(&self) -> Result<Vec<GattService>>;

    /// Enable notifications on a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error if the characteristic is unknown or the CCCD write fails.
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Write a value with response
    ///
    /// # Errors
    ///
    /// Returns an error if the characteristic is unknown or the write fails.
    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()>;

    /// Stream of notified values
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    async fn notifications(&self) -> Result<BoxStream<'static, Notification>>;

    /// Stream that yields once per link loss
    ///
    /// # Errors
    ///
    /// Returns an error if the radio event stream cannot be opened.
    async fn disconnections(&self) -> Result<BoxStream<'static, ()>>;

    /// Close the link
    ///
    /// # Errors
    ///
    /// Returns an error if the radio refuses to disconnect.
    async fn disconnect(&self) -> Result<()>;
}

/// Central radio backed by btleplug
pub struct BtleplugCentral {
    adapter: Adapter,
}

impl BtleplugCentral {
    /// Open the adapter chosen by `selector`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::AdapterNotFound`] if no adapter matches, or
    /// [`BridgeError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new(selector: &AdapterSelector) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;

        let adapter = match selector {
            AdapterSelector::Index(index) => adapters.into_iter().nth(*index),
            AdapterSelector::Name(name) => {
                let mut found = None;
                for adapter in adapters {
                    let info = adapter.adapter_info().await?;
                    if info.contains(name.as_str()) {
                        found = Some(adapter);
                        break;
                    }
                }
                found
            }
        }
        .ok_or_else(|| BridgeError::AdapterNotFound(selector.to_string()))?;

        info!("Using central adapter {}", adapter.adapter_info().await?);
        Ok(Self { adapter })
    }

    async fn matching_device(
        &self,
        id: &PeripheralId,
        blacklist: Option<&str>,
    ) -> Option<BtleplugDevice> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;
        if !properties.services.contains(&FTMS_SERVICE_UUID) {
            return None;
        }
        let address = peripheral.address().to_string();
        if blacklist.is_some_and(|b| b.eq_ignore_ascii_case(&address)) {
            debug!("Skipping blacklisted device {address}");
            return None;
        }
        Some(BtleplugDevice {
            adapter: self.adapter.clone(),
            name: properties.local_name,
            peripheral,
        })
    }
}

#[async_trait]
impl CentralRadio for BtleplugCentral {
    async fn discover(
        &self,
        timeout: Duration,
        blacklist: Option<&str>,
    ) -> Result<Option<Box<dyn RemoteDevice>>> {
        info!("Scanning for FTMS devices...");
        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![FTMS_SERVICE_UUID],
            })
            .await?;

        let found = tokio::time::timeout(timeout, async {
            if let Ok(known) = self.adapter.peripherals().await {
                for peripheral in known {
                    if let Some(device) = self.matching_device(&peripheral.id(), blacklist).await {
                        return Some(device);
                    }
                }
            }
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                if let Some(device) = self.matching_device(&id, blacklist).await {
                    return Some(device);
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {e}");
        }

        Ok(found.map(|device| {
            info!(
                "Found FTMS device {} ({})",
                device.name.as_deref().unwrap_or("unnamed"),
                device.address()
            );
            Box::new(device) as Box<dyn RemoteDevice>
        }))
    }
}

struct BtleplugDevice {
    adapter: Adapter,
    name: Option<String>,
    peripheral: Peripheral,
}

impl BtleplugDevice {
    fn characteristic(&self, uuid: Uuid) -> Result<btleplug::api::Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BridgeError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl RemoteDevice for BtleplugDevice {
    fn address(&self) -> String {
        self.peripheral.address().to_string()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        flags: CharacteristicFlags {
                            read: c.properties.contains(CharPropFlags::READ),
                            write: c.properties.contains(CharPropFlags::WRITE),
                            write_without_response: c
                                .properties
                                .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                            notify: c.properties.contains(CharPropFlags::NOTIFY),
                            indicate: c.properties.contains(CharPropFlags::INDICATE),
                        },
                    })
                    .collect(),
            })
            .collect())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| Notification {
                uuid: n.uuid,
                value: Bytes::from(n.value),
            })
            .boxed())
    }

    async fn disconnections(&self) -> Result<BoxStream<'static, ()>> {
        let id = self.peripheral.id();
        let events = self.adapter.events().await?;
        Ok(events
            .filter_map(move |event| {
                let lost = matches!(event, CentralEvent::DeviceDisconnected(ref d) if *d == id);
                async move { lost.then_some(()) }
            })
            .boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Events published by the treadmill link
#[derive(Debug, Clone, PartialEq)]
pub enum TreadmillEvent {
    /// Link state machine moved
    StateChanged(LinkState),
    /// Parsed treadmill data
    Sample(TreadmillSample),
    /// Fitness machine status
    Status(MachineStatus),
    /// Training status
    TrainingStatus(TrainingStatus),
    /// Connected (subscribed) or lost
    ConnectionChanged(bool),
    /// Free-text status line
    Diagnostic(String),
}

/// BLE central link to an FTMS treadmill
///
/// Each [`connect`](Self::connect) spawns a session task that walks the
/// state machine and then owns the device: it decodes notifications and
/// performs every control point write, one at a time, paced.
pub struct TreadmillLink {
    config: TreadmillLinkConfig,
    events: broadcast::Sender<TreadmillEvent>,
    state: Arc<watch::Sender<LinkState>>,
    commands: Option<mpsc::Sender<Bytes>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TreadmillLink {
    /// Create an idle link
    #[must_use]
    pub fn new(config: TreadmillLinkConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (state, _) = watch::channel(LinkState::Idle);
        Self {
            config,
            events,
            state: Arc::new(state),
            commands: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Subscribe to link events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TreadmillEvent> {
        self.events.subscribe()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Start a connection attempt, dropping any previous session first
    ///
    /// Progress is reported through [`subscribe`](Self::subscribe);
    /// `ConnectionChanged(true)` follows once notifications are enabled.
    /// `blacklist` overrides the configured blacklist address.
    pub async fn connect(&mut self, radio: Arc<dyn CentralRadio>, blacklist: Option<String>) {
        self.disconnect().await;

        let (commands_tx, commands_rx) = mpsc::channel(32);
        self.cancel = CancellationToken::new();
        self.commands = Some(commands_tx);

        let session = Session {
            radio,
            blacklist: blacklist.or_else(|| self.config.blacklist_address.clone()),
            config: self.config.clone(),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            commands: commands_rx,
            cancel: self.cancel.clone(),
        };
        self.task = Some(tokio::spawn(session.run()));
    }

    /// Queue a control point command
    ///
    /// Does nothing unless the link is [`LinkState::Subscribed`].
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] if the session ended while queuing.
    pub async fn send_command(&self, command: ControlCommand) -> Result<()> {
        debug!("Treadmill command: {command}");
        self.send_raw(ftms::encode_control_point(command)).await
    }

    /// Queue raw control point bytes, written verbatim
    ///
    /// Does nothing unless the link is [`LinkState::Subscribed`].
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] if the session ended while queuing.
    pub async fn send_raw(&self, value: Bytes) -> Result<()> {
        let state = self.state();
        if state != LinkState::Subscribed {
            debug!("Dropping control write {:02X?}: link is {state}", value.as_ref());
            return Ok(());
        }
        let Some(commands) = &self.commands else {
            return Ok(());
        };
        commands.send(value).await.map_err(|_| BridgeError::NotReady {
            reason: "treadmill session ended".to_string(),
        })
    }

    /// Close the session and wait for its task; safe to call repeatedly
    pub async fn disconnect(&mut self) {
        self.cancel.cancel();
        self.commands = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Treadmill session ended abnormally: {e}");
            }
        }
    }
}

impl Drop for TreadmillLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Session {
    radio: Arc<dyn CentralRadio>,
    config: TreadmillLinkConfig,
    blacklist: Option<String>,
    events: broadcast::Sender<TreadmillEvent>,
    state: Arc<watch::Sender<LinkState>>,
    commands: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl Session {
    fn emit(&self, event: TreadmillEvent) {
        let _ = self.events.send(event);
    }

    fn diagnostic(&self, text: String) {
        self.emit(TreadmillEvent::Diagnostic(text));
    }

    fn set_state(&self, state: LinkState) {
        if self.state.send_replace(state) != state {
            info!("Treadmill link: {state}");
            self.emit(TreadmillEvent::StateChanged(state));
        }
    }

    fn fail(&self, state: LinkState, error: &BridgeError) {
        warn!("Treadmill link failed: {error}");
        self.diagnostic(error.to_string());
        self.set_state(state);
        self.emit(TreadmillEvent::ConnectionChanged(false));
    }

    async fn run(mut self) {
        self.set_state(LinkState::Discovering);
        let timeout_ms = self.config.discovery_timeout_ms;
        let discovered = tokio::select! {
            () = self.cancel.cancelled() => {
                self.set_state(LinkState::Idle);
                return;
            }
            result = self.radio.discover(
                Duration::from_millis(timeout_ms),
                self.blacklist.as_deref(),
            ) => result,
        };

        let device = match discovered {
            Ok(Some(device)) => device,
            Ok(None) => {
                self.fail(LinkState::Idle, &BridgeError::DiscoveryTimeout { timeout_ms });
                return;
            }
            Err(e) => {
                self.fail(LinkState::Idle, &e);
                return;
            }
        };

        let setup = tokio::select! {
            () = self.cancel.cancelled() => None,
            result = self.setup(device.as_ref()) => Some(result),
        };
        match setup {
            Some(Ok((notifications, disconnections))) => {
                self.set_state(LinkState::Subscribed);
                self.emit(TreadmillEvent::ConnectionChanged(true));
                self.serve(device.as_ref(), notifications, disconnections).await;
            }
            Some(Err(e)) => {
                if let Err(e) = device.disconnect().await {
                    debug!("Disconnect after failed setup: {e}");
                }
                self.fail(LinkState::Disconnected, &e);
            }
            None => {
                if let Err(e) = device.disconnect().await {
                    debug!("Disconnect during setup: {e}");
                }
                self.set_state(LinkState::Disconnected);
            }
        }
    }

    async fn setup(
        &self,
        device: &dyn RemoteDevice,
    ) -> Result<(BoxStream<'static, Notification>, BoxStream<'static, ()>)> {
        let address = device.address();
        self.set_state(LinkState::ServiceResolving);
        info!(
            "Connecting to {} ({address})",
            device.name().as_deref().unwrap_or("treadmill")
        );
        device.connect().await?;

        let services = device.discover_services().await?;
        let service = services
            .into_iter()
            .find(|s| s.uuid == FTMS_SERVICE_UUID)
            .ok_or_else(|| BridgeError::ServiceNotFound(address.clone()))?;

        self.set_state(LinkState::CharacteristicSetup);
        let find = |uuid: Uuid| service.characteristics.iter().find(|c| c.uuid == uuid);

        let data = find(TREADMILL_DATA_UUID)
            .filter(|c| c.flags.can_notify())
            .ok_or(BridgeError::CharacteristicNotFound(TREADMILL_DATA_UUID))?;
        find(CONTROL_POINT_UUID)
            .filter(|c| c.flags.can_write())
            .ok_or(BridgeError::CharacteristicNotFound(CONTROL_POINT_UUID))?;

        let mut notify = vec![data.uuid];
        for uuid in [MACHINE_STATUS_UUID, TRAINING_STATUS_UUID] {
            match find(uuid) {
                Some(c) if c.flags.can_notify() => notify.push(uuid),
                Some(_) => debug!("Characteristic {uuid} does not notify"),
                None => warn!("Treadmill does not expose {uuid}"),
            }
        }

        let notifications = device.notifications().await?;
        let disconnections = device.disconnections().await?;
        for uuid in notify {
            debug!("Enabling notifications on {uuid}");
            device.subscribe(uuid).await?;
        }

        info!("Subscribed to treadmill {address}");
        Ok((notifications, disconnections))
    }

    async fn serve(
        &mut self,
        device: &dyn RemoteDevice,
        mut notifications: BoxStream<'static, Notification>,
        mut disconnections: BoxStream<'static, ()>,
    ) {
        let pacing = Duration::from_millis(self.config.write_pacing_ms);
        let mut paced_until: Option<Instant> = None;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("Disconnecting from treadmill");
                    if let Err(e) = device.disconnect().await {
                        warn!("Treadmill disconnect failed: {e}");
                    }
                    self.set_state(LinkState::Disconnected);
                    self.emit(TreadmillEvent::ConnectionChanged(false));
                    return;
                }
                () = tokio::time::sleep_until(paced_until.unwrap_or_else(Instant::now)),
                    if paced_until.is_some() =>
                {
                    paced_until = None;
                }
                command = self.commands.recv(), if paced_until.is_none() => {
                    let Some(value) = command else {
                        self.cancel.cancel();
                        continue;
                    };
                    self.write(device, &value).await;
                    paced_until = Some(Instant::now() + pacing);
                }
                notification = notifications.next() => {
                    match notification {
                        Some(n) => self.handle_notification(&n),
                        None => {
                            self.fail(LinkState::Disconnected, &BridgeError::UnsolicitedDisconnect);
                            return;
                        }
                    }
                }
                Some(()) = disconnections.next() => {
                    self.fail(LinkState::Disconnected, &BridgeError::UnsolicitedDisconnect);
                    return;
                }
            }
        }
    }

    async fn write(&self, device: &dyn RemoteDevice, value: &Bytes) {
        debug!("Control point <- {:02X?}", value.as_ref());
        if let Err(e) = device.write(CONTROL_POINT_UUID, value).await {
            let error = BridgeError::WriteRejected(e.to_string());
            warn!("{error}");
            self.diagnostic(error.to_string());
            self.set_state(LinkState::Degraded);
        }
    }

    fn handle_notification(&self, notification: &Notification) {
        let event = match notification.uuid {
            TREADMILL_DATA_UUID => {
                ftms::decode_treadmill_data(&notification.value).map(TreadmillEvent::Sample)
            }
            MACHINE_STATUS_UUID => ftms::decode_status(&notification.value).map(TreadmillEvent::Status),
            TRAINING_STATUS_UUID => {
                ftms::decode_training_status(&notification.value).map(TreadmillEvent::TrainingStatus)
            }
            other => {
                trace!("Ignoring notification from {other}");
                return;
            }
        };

        match event {
            Ok(event) => {
                if *self.state.borrow() == LinkState::Degraded {
                    self.set_state(LinkState::Subscribed);
                }
                self.emit(event);
            }
            Err(e) => {
                warn!(
                    "Dropping malformed notification {:02X?} from {}: {e}",
                    notification.value.as_ref(),
                    notification.uuid
                );
                self.diagnostic(format!("Malformed treadmill payload: {e}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCentral, MockDevice};

    fn test_config() -> TreadmillLinkConfig {
        TreadmillLinkConfig {
            discovery_timeout_ms: 100,
            write_pacing_ms: 10,
            blacklist_address: None,
        }
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<TreadmillEvent>, mut pred: F) -> TreadmillEvent
    where
        F: FnMut(&TreadmillEvent) -> bool,
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

    async fn connected_link(device: &MockDevice) -> (TreadmillLink, broadcast::Receiver<TreadmillEvent>) {
        let central = Arc::new(MockCentral::new());
        central.add_device(device.clone());
        let mut link = TreadmillLink::new(test_config());
        let mut rx = link.subscribe();
        link.connect(central, None).await;
        next_matching(&mut rx, |e| matches!(e, TreadmillEvent::ConnectionChanged(true))).await;
        (link, rx)
    }

    #[tokio::test]
    async fn test_connect_walks_state_machine() {
        let device = MockDevice::treadmill("AA:BB:CC:DD:EE:01");
        let central = Arc::new(MockCentral::new());
        central.add_device(device.clone());

        let mut link = TreadmillLink::new(test_config());
        let mut rx = link.subscribe();
        link.connect(central, None).await;

        let mut states = Vec::new();
        next_matching(&mut rx, |e| {
            if let TreadmillEvent::StateChanged(s) = e {
                states.push(*s);
            }
            matches!(e, TreadmillEvent::ConnectionChanged(true))
        })
        .await;

        assert_eq!(
            states,
            vec![
                LinkState::Discovering,
                LinkState::ServiceResolving,
                LinkState::CharacteristicSetup,
                LinkState::Subscribed
            ]
        );
        assert_eq!(link.state(), LinkState::Subscribed);

        let subscriptions = device.subscriptions();
        assert!(subscriptions.contains(&TREADMILL_DATA_UUID));
        assert!(subscriptions.contains(&MACHINE_STATUS_UUID));
        assert!(subscriptions.contains(&TRAINING_STATUS_UUID));
        assert_eq!(device.connect_count(), 1);

        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_notifications_are_decoded() {
        let device = MockDevice::treadmill("AA:BB:CC:DD:EE:02");
        let (mut link, mut rx) = connected_link(&device).await;

        device.notify(TREADMILL_DATA_UUID, &[0x00, 0x00, 0xB0, 0x04]);
        let event = next_matching(&mut rx, |e| matches!(e, TreadmillEvent::Sample(_))).await;
        let TreadmillEvent::Sample(sample) = event else { unreachable!() };
        assert_eq!(sample.instantaneous_speed, Some(1200));

        device.notify(MACHINE_STATUS_UUID, &[0x04]);
        let event = next_matching(&mut rx, |e| matches!(e, TreadmillEvent::Status(_))).await;
        assert_eq!(event, TreadmillEvent::Status(ftms::decode_status(&[0x04]).unwrap()));

        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_malformed_payload_keeps_link_up() {
        let device = MockDevice::treadmill("AA:BB:CC:DD:EE:03");
        let (mut link, mut rx) = connected_link(&device).await;

        device.notify(TREADMILL_DATA_UUID, &[0x04, 0x00, 0xE8]);
        let event = next_matching(&mut rx, |e| matches!(e, TreadmillEvent::Diagnostic(_))).await;
        let TreadmillEvent::Diagnostic(text) = event else { unreachable!() };
        assert!(text.contains("Truncated"));
        assert_eq!(link.state(), LinkState::Subscribed);

        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_is_noop_until_subscribed() {
        let link = TreadmillLink::new(test_config());
        link.send_command(ControlCommand::Start).await.unwrap();
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[tokio::test]
    async fn test_control_writes_are_serialised() {
        let device = MockDevice::treadmill("AA:BB:CC:DD:EE:04");
        let (mut link, _rx) = connected_link(&device).await;

        link.send_command(ControlCommand::RequestControl).await.unwrap();
        link.send_command(ControlCommand::SetTargetSpeed(1000)).await.unwrap();
        link.send_raw(Bytes::from_static(&[0x07])).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while device.control_writes().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            device.control_writes(),
            vec![
                Bytes::from_static(&[0x00]),
                Bytes::from_static(&[0x02, 0xE8, 0x03]),
                Bytes::from_static(&[0x07]),
            ]
        );
        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_failed_write_degrades_until_next_notification() {
        let device = MockDevice::treadmill("AA:BB:CC:DD:EE:05");
        let (mut link, mut rx) = connected_link(&device).await;

        device.set_fail_writes(true);
        link.send_command(ControlCommand::Start).await.unwrap();
        next_matching(&mut rx, |e| *e == TreadmillEvent::StateChanged(LinkState::Degraded)).await;

        // commands are dropped while degraded
        link.send_command(ControlCommand::Reset).await.unwrap();

        device.notify(TREADMILL_DATA_UUID, &[0x00, 0x00, 0x00, 0x00]);
        next_matching(&mut rx, |e| *e == TreadmillEvent::StateChanged(LinkState::Subscribed)).await;
        assert_eq!(device.control_writes().len(), 0);

        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect() {
        let device = MockDevice::treadmill("AA:BB:CC:DD:EE:06");
        let (mut link, mut rx) = connected_link(&device).await;

        device.drop_link();
        next_matching(&mut rx, |e| matches!(e, TreadmillEvent::ConnectionChanged(false))).await;
        assert_eq!(link.state(), LinkState::Disconnected);

        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_discovery_timeout_returns_to_idle() {
        let central = Arc::new(MockCentral::new());
        let mut link = TreadmillLink::new(test_config());
        let mut rx = link.subscribe();
        link.connect(central.clone(), None).await;

        let event = next_matching(&mut rx, |e| matches!(e, TreadmillEvent::Diagnostic(_))).await;
        let TreadmillEvent::Diagnostic(text) = event else { unreachable!() };
        assert!(text.contains("No FTMS device"));
        next_matching(&mut rx, |e| matches!(e, TreadmillEvent::ConnectionChanged(false))).await;
        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(central.discover_count(), 1);

        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_blacklisted_device_is_skipped() {
        let central = Arc::new(MockCentral::new());
        central.add_device(MockDevice::treadmill("AA:BB:CC:DD:EE:07"));
        let mut link = TreadmillLink::new(test_config());
        let mut rx = link.subscribe();
        link.connect(central, Some("aa:bb:cc:dd:ee:07".to_string())).await;

        next_matching(&mut rx, |e| matches!(e, TreadmillEvent::ConnectionChanged(false))).await;
        assert_eq!(link.state(), LinkState::Idle);
        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_missing_service_disconnects() {
        let device = MockDevice::with_services("AA:BB:CC:DD:EE:08", Vec::new());
        let central = Arc::new(MockCentral::new());
        central.add_device(device.clone());
        let mut link = TreadmillLink::new(test_config());
        let mut rx = link.subscribe();
        link.connect(central, None).await;

        let event = next_matching(&mut rx, |e| matches!(e, TreadmillEvent::Diagnostic(_))).await;
        let TreadmillEvent::Diagnostic(text) = event else { unreachable!() };
        assert!(text.contains("FTMS service not found"));
        next_matching(&mut rx, |e| matches!(e, TreadmillEvent::ConnectionChanged(false))).await;
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(device.disconnect_count(), 1);
        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let device = MockDevice::treadmill("AA:BB:CC:DD:EE:09");
        let (mut link, _rx) = connected_link(&device).await;

        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);
        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(device.disconnect_count(), 1);
    }

    #[test]
    fn test_characteristic_flags() {
        let flags = CharacteristicFlags {
            indicate: true,
            ..CharacteristicFlags::default()
        };
        assert!(flags.can_notify());
        assert!(!flags.can_write());
    }
}
