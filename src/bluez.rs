use async_trait::async_trait;
use bluer::{
    adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType},
    gatt::local::{
        Application, ApplicationHandle, Characteristic, CharacteristicNotifier,
        CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
        CharacteristicWriteMethod, Service,
    },
    Adapter, Session,
};
use bytes::Bytes;
use futures::FutureExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    companion::{
        GattProfile, GattServer, GattServerHandle, LocalCharacteristic, PeripheralEvent,
        PeripheralRadio,
    },
    error::{BridgeError, Result},
    types::AdapterSelector,
    FTMS_SERVICE_UUID,
};

/// FTMS service data: machine available, treadmill supported
const FTMS_SERVICE_DATA: [u8; 2] = [0x01, 0x01];

/// How often lapsed notification sessions are swept
const SESSION_SWEEP: Duration = Duration::from_millis(500);

type Values = Arc<StdMutex<HashMap<Uuid, Vec<u8>>>>;
type Notifiers = Arc<Mutex<HashMap<Uuid, CharacteristicNotifier>>>;

/// Peripheral radio backed by BlueZ over D-Bus
pub struct BluezPeripheral {
    _session: Session,
    adapter: Adapter,
}

impl BluezPeripheral {
    /// Open and power the adapter chosen by `selector`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::AdapterNotFound`] if no adapter matches, or
    /// [`BridgeError::Bluez`] if bluetoothd cannot be reached.
    pub async fn new(selector: &AdapterSelector) -> Result<Self> {
        let session = Session::new().await?;
        let name = match selector {
            AdapterSelector::Index(index) => session.adapter_names().await?.into_iter().nth(*index),
            AdapterSelector::Name(name) => Some(name.clone()),
        }
        .ok_or_else(|| BridgeError::AdapterNotFound(selector.to_string()))?;

        let adapter = session
            .adapter(&name)
            .map_err(|_| BridgeError::AdapterNotFound(name.clone()))?;
        adapter.set_powered(true).await?;
        info!(
            "Using peripheral adapter {} ({})",
            adapter.name(),
            adapter.address().await?
        );

        Ok(Self {
            _session: session,
            adapter,
        })
    }
}

fn advertisement(profile: &GattProfile) -> Advertisement {
    Advertisement {
        advertisement_type: AdvertisementType::Peripheral,
        service_uuids: profile.advertised_services.iter().copied().collect(),
        service_data: [(FTMS_SERVICE_UUID, FTMS_SERVICE_DATA.to_vec())].into_iter().collect(),
        local_name: Some(profile.local_name.clone()),
        discoverable: Some(true),
        ..Default::default()
    }
}

fn characteristic(
    local: &LocalCharacteristic,
    values: &Values,
    notifiers: &Notifiers,
    events: &mpsc::Sender<PeripheralEvent>,
) -> Characteristic {
    let uuid = local.uuid;

    let read = local.flags.read.then(|| {
        let values = Arc::clone(values);
        CharacteristicRead {
            read: true,
            fun: Box::new(move |_req| {
                let value = values
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&uuid)
                    .cloned()
                    .unwrap_or_default();
                async move { Ok(value) }.boxed()
            }),
            ..Default::default()
        }
    });

    let write = local.flags.can_write().then(|| {
        let events = events.clone();
        CharacteristicWrite {
            write: local.flags.write,
            write_without_response: local.flags.write_without_response,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, _req| {
                let events = events.clone();
                async move {
                    let _ = events.send(PeripheralEvent::ControlWrite(Bytes::from(value))).await;
                    Ok(())
                }
                .boxed()
            })),
            ..Default::default()
        }
    });

    let notify = local.flags.can_notify().then(|| {
        let notifiers = Arc::clone(notifiers);
        let events = events.clone();
        CharacteristicNotify {
            notify: local.flags.notify,
            indicate: local.flags.indicate,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let notifiers = Arc::clone(&notifiers);
                let events = events.clone();
                async move {
                    debug!("Companion subscribed to {uuid}");
                    let mut notifiers = notifiers.lock().await;
                    let first = notifiers.is_empty();
                    notifiers.insert(uuid, notifier);
                    if first {
                        let _ = events.send(PeripheralEvent::Connected).await;
                    }
                }
                .boxed()
            })),
            ..Default::default()
        }
    });

    Characteristic {
        uuid,
        read,
        write,
        notify,
        ..Default::default()
    }
}

#[async_trait]
impl PeripheralRadio for BluezPeripheral {
    async fn publish(&self, profile: &GattProfile) -> Result<GattServerHandle> {
        let (events_tx, events) = mpsc::channel(32);
        let values: Values = Arc::new(StdMutex::new(
            profile
                .services
                .iter()
                .flat_map(|s| s.characteristics.iter())
                .map(|c| (c.uuid, c.value.to_vec()))
                .collect(),
        ));
        let notifiers: Notifiers = Arc::new(Mutex::new(HashMap::new()));

        let app = Application {
            services: profile
                .services
                .iter()
                .map(|service| Service {
                    uuid: service.uuid,
                    primary: true,
                    characteristics: service
                        .characteristics
                        .iter()
                        .map(|c| characteristic(c, &values, &notifiers, &events_tx))
                        .collect(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let app_handle = self.adapter.serve_gatt_application(app).await?;
        let adv_handle = self.adapter.advertise(advertisement(profile)).await?;

        let cancel = CancellationToken::new();
        tokio::spawn(sweep_sessions(Arc::clone(&notifiers), events_tx, cancel.clone()));

        Ok(GattServerHandle {
            events,
            server: Box::new(BluezGattServer {
                adapter: self.adapter.clone(),
                advertisement: advertisement(profile),
                values,
                notifiers,
                cancel,
                adv_handle: Mutex::new(Some(adv_handle)),
                app_handle: Mutex::new(Some(app_handle)),
            }),
        })
    }

    async fn local_address(&self) -> Result<String> {
        Ok(self.adapter.address().await?.to_string())
    }
}

/// Drop stopped notification sessions; report a disconnect once none remain
async fn sweep_sessions(
    notifiers: Notifiers,
    events: mpsc::Sender<PeripheralEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SESSION_SWEEP);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let ended = {
            let mut notifiers = notifiers.lock().await;
            let had_sessions = !notifiers.is_empty();
            notifiers.retain(|_, n| !n.is_stopped());
            had_sessions && notifiers.is_empty()
        };
        if ended {
            debug!("All companion notification sessions ended");
            if events.send(PeripheralEvent::Disconnected).await.is_err() {
                return;
            }
        }
    }
}

struct BluezGattServer {
    adapter: Adapter,
    advertisement: Advertisement,
    values: Values,
    notifiers: Notifiers,
    cancel: CancellationToken,
    adv_handle: Mutex<Option<AdvertisementHandle>>,
    app_handle: Mutex<Option<ApplicationHandle>>,
}

#[async_trait]
impl GattServer for BluezGattServer {
    async fn notify(&self, characteristic: Uuid, value: Bytes) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(characteristic, value.to_vec());

        let mut notifiers = self.notifiers.lock().await;
        if let Some(notifier) = notifiers.get_mut(&characteristic) {
            if notifier.is_stopped() {
                notifiers.remove(&characteristic);
            } else {
                notifier.notify(value.to_vec()).await?;
            }
        }
        Ok(())
    }

    async fn resume_advertising(&self) -> Result<()> {
        let mut handle = self.adv_handle.lock().await;
        handle.take();
        *handle = Some(self.adapter.advertise(self.advertisement.clone()).await?);
        info!("Companion advertising resumed");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.notifiers.lock().await.clear();
        if self.adv_handle.lock().await.take().is_none() {
            warn!("Companion advertisement already released");
        }
        self.app_handle.lock().await.take();
        info!("Companion GATT application unregistered");
        Ok(())
    }
}
