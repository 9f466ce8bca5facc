use std::{sync::Arc, time::Duration};
use tracing::info;
use treadbridge::{
    bridge::{BridgeRadios, FtmsBridge},
    ftms,
    mock::{MockAntStick, MockCentral, MockDevice, MockPeripheralRadio},
    AdapterMode, AdapterSelector, BridgeConfig, BridgeEvent, Result, TreadmillSample,
    TREADMILL_DATA_UUID,
};

/// Runs the whole bridge against in-memory radios: a treadmill that speeds
/// up for a few seconds, a companion that connects, and an ANT stick.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🧪 Treadbridge simulated bridge");

    let treadmill = MockDevice::treadmill("AA:BB:CC:DD:EE:01");
    let central = Arc::new(MockCentral::new());
    central.add_device(treadmill.clone());
    let peripheral = MockPeripheralRadio::new("00:11:22:33:44:55");
    let stick = MockAntStick::new(Duration::from_millis(250));

    let config = BridgeConfig {
        mode: AdapterMode::ClientPlusServer {
            treadmill: AdapterSelector::Index(0),
            companion: AdapterSelector::Index(1),
        },
        ..BridgeConfig::default()
    };
    let radios = BridgeRadios::central_only(central)
        .with_peripheral(Arc::new(peripheral.clone()))
        .with_ant(Arc::new(stick.clone()));

    let mut bridge = FtmsBridge::start(config, radios);
    let mut events = bridge.subscribe();

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BridgeEvent::Telemetry(t) => {
                    info!("🏃 {:5.2} km/h, pace {}, {:.3} km", t.speed_kmh, t.pace, t.distance_km);
                }
                BridgeEvent::Diagnostic(line) => info!("ℹ️  {line}"),
                BridgeEvent::TreadmillConnection(c) => info!("Treadmill connected: {c}"),
                BridgeEvent::CompanionConnection(c) => info!("Companion connected: {c}"),
                _ => {}
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    peripheral.connect_companion();

    let mut distance = 0_u32;
    for second in 0..10_u16 {
        let speed = 600 + second * 60;
        distance += u32::from(speed) / 360;
        let sample = TreadmillSample {
            instantaneous_speed: Some(speed),
            total_distance: Some(distance),
            elapsed_time: Some(second),
            ..TreadmillSample::idle()
        };
        treadmill.notify(TREADMILL_DATA_UUID, &ftms::encode_treadmill_data(&sample));
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    info!(
        "📡 {} ANT+ pages broadcast, {} companion notifications",
        stick.broadcasts().len(),
        peripheral.notifications().len()
    );

    bridge.disconnect().await;
    printer.abort();
    Ok(())
}
