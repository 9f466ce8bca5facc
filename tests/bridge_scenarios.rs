use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};
use treadbridge::{
    bridge::{BridgeRadios, FtmsBridge},
    mock::{MockAntStick, MockCentral, MockDevice, MockPeripheralRadio},
    AdapterMode, AdapterSelector, AntConfig, BridgeConfig, BridgeEvent, CompanionConfig,
    ControlCommand, CoordinatorTiming, TreadmillLinkConfig, MACHINE_STATUS_UUID,
    TREADMILL_DATA_UUID,
};

const TREADMILL: &str = "AA:BB:CC:DD:EE:01";
const OWN_ADAPTER: &str = "00:11:22:33:44:55";

/// Speed-only treadmill data at 10.00 km/h
const TEN_KMH: [u8; 4] = [0x00, 0x00, 0xE8, 0x03];

/// Treadmill data at 10.00 km/h carrying average speed, total distance,
/// inclination, expended energy and elapsed time
fn full_sample(distance_m: u32, kcal: u16, elapsed_s: u16) -> [u8; 20] {
    let [d0, d1, d2, _] = distance_m.to_le_bytes();
    let [k0, k1] = kcal.to_le_bytes();
    let [e0, e1] = elapsed_s.to_le_bytes();
    [
        0x8E, 0x04, // flags
        0xE8, 0x03, // speed
        0xE8, 0x03, // average speed
        d0, d1, d2, // total distance
        0x00, 0x00, 0x00, 0x00, // inclination, ramp angle
        k0, k1, 0x00, 0x00, 0x00, // energy
        e0, e1, // elapsed time
    ]
}

fn test_config(mode: AdapterMode) -> BridgeConfig {
    BridgeConfig {
        mode,
        treadmill: TreadmillLinkConfig {
            discovery_timeout_ms: 100,
            write_pacing_ms: 10,
            blacklist_address: None,
        },
        companion: CompanionConfig {
            notify_interval_ms: 50,
            ..CompanionConfig::default()
        },
        ant: AntConfig {
            command_timeout_ms: 500,
            restart_delay_ms: 20,
            ..AntConfig::default()
        },
        timing: CoordinatorTiming {
            reconnect_delay_ms: 50,
            companion_rebuild_delay_ms: 50,
            stop_sequence_gap_ms: 20,
        },
    }
}

fn client_only() -> AdapterMode {
    AdapterMode::ClientOnly {
        treadmill: AdapterSelector::Index(0),
    }
}

fn client_plus_server() -> AdapterMode {
    AdapterMode::ClientPlusServer {
        treadmill: AdapterSelector::Index(0),
        companion: AdapterSelector::Index(1),
    }
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<BridgeEvent>, pred: F) -> BridgeEvent
where
    F: Fn(&BridgeEvent) -> bool,
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
    .expect("bridge event not received")
}

async fn diagnostic_containing(rx: &mut broadcast::Receiver<BridgeEvent>, text: &str) -> String {
    let event = next_matching(rx, |e| matches!(e, BridgeEvent::Diagnostic(d) if d.contains(text))).await;
    let BridgeEvent::Diagnostic(line) = event else { unreachable!() };
    line
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

struct Rig {
    device: MockDevice,
    central: Arc<MockCentral>,
    peripheral: MockPeripheralRadio,
    bridge: FtmsBridge,
    events: broadcast::Receiver<BridgeEvent>,
}

/// Start a bridge with one treadmill in range and wait until it is subscribed
async fn connected_rig(mode: AdapterMode, ant: Option<MockAntStick>) -> Rig {
    let device = MockDevice::treadmill(TREADMILL);
    let central = Arc::new(MockCentral::new());
    central.add_device(device.clone());
    let peripheral = MockPeripheralRadio::new(OWN_ADAPTER);

    let mut radios = BridgeRadios::central_only(central.clone())
        .with_peripheral(Arc::new(peripheral.clone()));
    if let Some(stick) = ant {
        radios = radios.with_ant(Arc::new(stick));
    }

    let bridge = FtmsBridge::start(test_config(mode), radios);
    let mut events = bridge.subscribe();
    next_matching(&mut events, |e| *e == BridgeEvent::TreadmillConnection(true)).await;

    Rig {
        device,
        central,
        peripheral,
        bridge,
        events,
    }
}

#[tokio::test]
async fn test_sample_mirrored_to_companion_and_presentation() {
    let own = MockDevice::treadmill(&OWN_ADAPTER.to_lowercase());
    let device = MockDevice::treadmill(TREADMILL);
    let central = Arc::new(MockCentral::new());
    central.add_device(own.clone());
    central.add_device(device.clone());
    let peripheral = MockPeripheralRadio::new(OWN_ADAPTER);

    let radios = BridgeRadios::central_only(central).with_peripheral(Arc::new(peripheral.clone()));
    let mut bridge = FtmsBridge::start(test_config(client_plus_server()), radios);
    let mut events = bridge.subscribe();

    next_matching(&mut events, |e| *e == BridgeEvent::TreadmillConnection(true)).await;
    assert_eq!(own.connect_count(), 0, "bridge connected to its own companion adapter");
    assert_eq!(device.connect_count(), 1);

    eventually(|| peripheral.publish_count() == 1).await;
    peripheral.connect_companion();
    next_matching(&mut events, |e| *e == BridgeEvent::CompanionConnection(true)).await;

    device.notify(TREADMILL_DATA_UUID, &TEN_KMH);
    let event = next_matching(&mut events, |e| matches!(e, BridgeEvent::Telemetry(_))).await;
    let BridgeEvent::Telemetry(telemetry) = event else { unreachable!() };
    assert!((telemetry.speed_kmh - 10.0).abs() < 1e-9);
    assert_eq!(telemetry.pace, "06:00");

    eventually(|| {
        peripheral.notifications_for(TREADMILL_DATA_UUID).last() == Some(&Bytes::from_static(&TEN_KMH))
    })
    .await;

    device.notify(MACHINE_STATUS_UUID, &[0x04]);
    next_matching(&mut events, |e| matches!(e, BridgeEvent::MachineStatus(_))).await;
    eventually(|| {
        peripheral.notifications_for(MACHINE_STATUS_UUID).last() == Some(&Bytes::from_static(&[0x04]))
    })
    .await;

    bridge.disconnect().await;
    assert_eq!(device.disconnect_count(), 1);
    assert_eq!(peripheral.shutdown_count(), 1);
}

#[tokio::test]
async fn test_companion_starts_only_after_treadmill_subscribed() {
    let central = Arc::new(MockCentral::new());
    let peripheral = MockPeripheralRadio::new(OWN_ADAPTER);
    let radios = BridgeRadios::central_only(central.clone()).with_peripheral(Arc::new(peripheral.clone()));
    let mut bridge = FtmsBridge::start(test_config(client_plus_server()), radios);
    let mut events = bridge.subscribe();

    next_matching(&mut events, |e| *e == BridgeEvent::TreadmillConnection(false)).await;
    assert_eq!(peripheral.publish_count(), 0);

    central.add_device(MockDevice::treadmill(TREADMILL));
    assert_ok!(bridge.reconnect().await);
    next_matching(&mut events, |e| *e == BridgeEvent::TreadmillConnection(true)).await;
    eventually(|| peripheral.publish_count() == 1).await;

    bridge.disconnect().await;
}

#[tokio::test]
async fn test_lost_treadmill_is_retried_exactly_once() {
    let mut rig = connected_rig(client_only(), None).await;

    rig.central.clear_devices();
    rig.device.drop_link();

    next_matching(&mut rig.events, |e| *e == BridgeEvent::TreadmillConnection(false)).await;
    let line = diagnostic_containing(&mut rig.events, "reconnecting").await;
    assert!(line.contains("50ms"));
    diagnostic_containing(&mut rig.events, "Reconnect failed").await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(rig.central.discover_count(), 2);

    rig.bridge.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_restores_link() {
    let mut rig = connected_rig(client_only(), None).await;

    rig.device.drop_link();
    diagnostic_containing(&mut rig.events, "reconnecting").await;
    next_matching(&mut rig.events, |e| *e == BridgeEvent::TreadmillConnection(true)).await;
    assert_eq!(rig.device.connect_count(), 2);

    // commands flow again after the reconnect
    assert_ok!(rig.bridge.send_command(ControlCommand::Start).await);
    eventually(|| rig.device.control_writes() == vec![Bytes::from_static(&[0x07])]).await;

    rig.bridge.disconnect().await;
}

#[tokio::test]
async fn test_manual_reconnect_while_connected_connects_once() {
    let mut rig = connected_rig(client_only(), None).await;

    assert_ok!(rig.bridge.reconnect().await);
    next_matching(&mut rig.events, |e| *e == BridgeEvent::TreadmillConnection(true)).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(rig.device.connect_count(), 2);
    assert_eq!(rig.central.discover_count(), 2);
    while let Ok(event) = rig.events.try_recv() {
        if let BridgeEvent::Diagnostic(line) = event {
            assert!(!line.contains("reconnecting"), "unexpected retry: {line}");
        }
    }

    rig.bridge.disconnect().await;
}

/// Let the ANT+ supervisor pick up the latest inputs
async fn settle(stick: &MockAntStick) {
    let sent = stick.broadcasts().len();
    eventually(|| stick.broadcasts().len() >= sent + 10).await;
}

fn distance_bytes(stick: &MockAntStick) -> Vec<u8> {
    stick
        .broadcasts()
        .iter()
        .filter(|page| page[0] == 1)
        .map(|page| page[3])
        .collect()
}

#[tokio::test]
async fn test_full_sample_flows_to_ant_and_companion_across_reconnect() {
    let stick = MockAntStick::new(Duration::from_millis(5));
    let mut rig = connected_rig(client_plus_server(), Some(stick.clone())).await;
    eventually(|| rig.peripheral.publish_count() == 1).await;
    rig.peripheral.connect_companion();
    next_matching(&mut rig.events, |e| *e == BridgeEvent::CompanionConnection(true)).await;

    let first = full_sample(12_000, 300, 3_600);
    rig.device.notify(TREADMILL_DATA_UUID, &first);
    let event = next_matching(&mut rig.events, |e| matches!(e, BridgeEvent::Sample(_))).await;
    let BridgeEvent::Sample(sample) = event else { unreachable!() };
    assert_eq!(sample.total_distance, Some(12_000));
    assert_eq!(sample.elapsed_time, Some(3_600));
    eventually(|| {
        rig.peripheral.notifications_for(TREADMILL_DATA_UUID).last() == Some(&Bytes::copy_from_slice(&first))
    })
    .await;
    settle(&stick).await;

    rig.device.notify(TREADMILL_DATA_UUID, &full_sample(12_010, 301, 3_604));
    eventually(|| distance_bytes(&stick).last() == Some(&10)).await;

    // the treadmill comes back reporting a larger running total
    rig.device.drop_link();
    diagnostic_containing(&mut rig.events, "reconnecting").await;
    next_matching(&mut rig.events, |e| *e == BridgeEvent::TreadmillConnection(true)).await;
    settle(&stick).await;

    let resumed = full_sample(20_000, 500, 10);
    rig.device.notify(TREADMILL_DATA_UUID, &resumed);
    eventually(|| {
        rig.peripheral.notifications_for(TREADMILL_DATA_UUID).last() == Some(&Bytes::copy_from_slice(&resumed))
    })
    .await;
    settle(&stick).await;

    rig.device.notify(TREADMILL_DATA_UUID, &full_sample(20_005, 501, 12));
    eventually(|| distance_bytes(&stick).last() == Some(&15)).await;
    assert!(
        distance_bytes(&stick).iter().all(|d| [0, 10, 15].contains(d)),
        "distance jumped: {:?}",
        distance_bytes(&stick)
    );

    rig.bridge.disconnect().await;
}

#[tokio::test]
async fn test_companion_writes_relayed_verbatim() {
    let mut rig = connected_rig(client_plus_server(), None).await;
    eventually(|| rig.peripheral.publish_count() == 1).await;

    rig.peripheral.write_control(&[0x02, 0xE8, 0x03]);
    rig.peripheral.write_control(&[0x7F, 0x01, 0x02]);

    eventually(|| rig.device.control_writes().len() == 2).await;
    assert_eq!(
        rig.device.control_writes(),
        vec![
            Bytes::from_static(&[0x02, 0xE8, 0x03]),
            Bytes::from_static(&[0x7F, 0x01, 0x02]),
        ]
    );

    rig.bridge.disconnect().await;
}

#[tokio::test]
async fn test_companion_rebuilt_with_cached_values() {
    let mut rig = connected_rig(client_plus_server(), None).await;
    eventually(|| rig.peripheral.publish_count() == 1).await;

    rig.device.notify(TREADMILL_DATA_UUID, &TEN_KMH);
    next_matching(&mut rig.events, |e| matches!(e, BridgeEvent::Sample(_))).await;

    rig.peripheral.connect_companion();
    next_matching(&mut rig.events, |e| *e == BridgeEvent::CompanionConnection(true)).await;
    rig.peripheral.disconnect_companion();
    next_matching(&mut rig.events, |e| *e == BridgeEvent::CompanionConnection(false)).await;

    eventually(|| rig.peripheral.publish_count() == 2).await;
    assert_eq!(rig.peripheral.resume_count(), 1);
    let profile = rig.peripheral.last_profile().unwrap();
    assert_eq!(
        profile.characteristic(TREADMILL_DATA_UUID).unwrap().value,
        Bytes::from_static(&TEN_KMH)
    );

    rig.bridge.disconnect().await;
}

#[tokio::test]
async fn test_dead_gatt_server_is_rebuilt() {
    let mut rig = connected_rig(client_plus_server(), None).await;
    eventually(|| rig.peripheral.publish_count() == 1).await;

    rig.peripheral.kill_server();
    diagnostic_containing(&mut rig.events, "GATT server closed").await;
    eventually(|| rig.peripheral.publish_count() == 2).await;

    rig.bridge.disconnect().await;
}

#[tokio::test]
async fn test_ant_broadcast_follows_treadmill_and_survives_overflow() {
    let stick = MockAntStick::new(Duration::from_millis(5));
    let mut rig = connected_rig(client_only(), Some(stick.clone())).await;

    rig.device.notify(TREADMILL_DATA_UUID, &TEN_KMH);
    // 10 km/h is 2.78 m/s: integer part in the low nibble of byte 4
    eventually(|| stick.broadcasts().iter().any(|page| page[0] == 1 && page[4] & 0x0F == 2)).await;

    stick.inject_overflow();
    diagnostic_containing(&mut rig.events, "overflow").await;
    eventually(|| stick.open_count() == 2).await;
    let sent = stick.broadcasts().len();
    eventually(|| stick.broadcasts().len() > sent).await;

    rig.bridge.disconnect().await;
}

#[tokio::test]
async fn test_start_pause_toggles() {
    let mut rig = connected_rig(client_only(), None).await;

    assert_ok!(rig.bridge.start_pause().await);
    assert_ok!(rig.bridge.start_pause().await);
    eventually(|| rig.device.control_writes().len() == 2).await;
    assert_eq!(
        rig.device.control_writes(),
        vec![Bytes::from_static(&[0x07]), Bytes::from_static(&[0x08, 0x02])]
    );

    rig.bridge.disconnect().await;
}

#[tokio::test]
async fn test_stop_workout_sequence() {
    let mut rig = connected_rig(client_only(), None).await;

    assert_ok!(rig.bridge.stop_workout().await);
    eventually(|| rig.device.control_writes().len() == 4).await;
    assert_eq!(
        rig.device.control_writes(),
        vec![
            Bytes::from_static(&[0x08, 0x02]),
            Bytes::from_static(&[0x00]),
            Bytes::from_static(&[0x01]),
            Bytes::from_static(&[0x00]),
        ]
    );

    rig.bridge.disconnect().await;
}

#[tokio::test]
async fn test_adjustments_are_relative_to_latest_sample() {
    let mut rig = connected_rig(client_only(), None).await;

    rig.device.notify(TREADMILL_DATA_UUID, &TEN_KMH);
    next_matching(&mut rig.events, |e| matches!(e, BridgeEvent::Sample(_))).await;

    assert_ok!(rig.bridge.adjust_speed(1).await);
    assert_ok!(rig.bridge.adjust_incline(-1).await);
    assert_ok!(rig.bridge.set_pace("5:00").await);
    assert_ok!(rig.bridge.set_incline_percent(2.5).await);

    eventually(|| rig.device.control_writes().len() == 4).await;
    assert_eq!(
        rig.device.control_writes(),
        vec![
            // 10.20 km/h
            Bytes::from_static(&[0x02, 0xFC, 0x03]),
            // -0.5 %
            Bytes::from_static(&[0x03, 0xFB, 0xFF]),
            // 12.00 km/h
            Bytes::from_static(&[0x02, 0xB0, 0x04]),
            // 2.5 %
            Bytes::from_static(&[0x03, 0x19, 0x00]),
        ]
    );

    rig.bridge.disconnect().await;
}

#[tokio::test]
async fn test_invalid_presentation_input_rejected() {
    let mut rig = connected_rig(client_only(), None).await;

    assert_err!(rig.bridge.set_pace("fast").await);
    assert_err!(rig.bridge.set_pace("71582789:00").await);
    assert_err!(rig.bridge.set_speed_kmh(-1.0).await);
    assert_err!(rig.bridge.set_incline_percent(f64::NAN).await);

    rig.bridge.disconnect().await;
    assert!(rig.device.control_writes().is_empty());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let mut rig = connected_rig(client_only(), None).await;

    rig.bridge.disconnect().await;
    rig.bridge.disconnect().await;
    assert_eq!(rig.device.disconnect_count(), 1);
    assert_err!(rig.bridge.send_command(ControlCommand::Start).await);
}
