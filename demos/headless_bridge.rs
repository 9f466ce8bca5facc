use std::sync::Arc;
use tracing::{error, info, warn};
use treadbridge::{
    ant::SerialAntPort,
    ble::BtleplugCentral,
    bridge::{BridgeRadios, FtmsBridge},
    AdapterMode, AdapterSelector, BridgeConfig, BridgeEvent, Result,
};

/// Usage: `headless_bridge [--ant /dev/ttyUSB0] [--companion <adapter index>]`
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut ant_path = None;
    let mut companion_adapter = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--ant" => ant_path = args.next(),
            "--companion" => {
                companion_adapter = args.next().and_then(|index| index.parse::<usize>().ok());
            }
            other => warn!("Ignoring unknown argument {other}"),
        }
    }

    let mut config = BridgeConfig::default();
    if let Some(index) = companion_adapter {
        config.mode = AdapterMode::ClientPlusServer {
            treadmill: AdapterSelector::Index(0),
            companion: AdapterSelector::Index(index),
        };
    }

    info!("🏃 Treadbridge headless bridge");
    let central = BtleplugCentral::new(config.mode.treadmill_adapter()).await?;
    let mut radios = BridgeRadios::central_only(Arc::new(central));

    if let Some(path) = ant_path {
        info!("📡 ANT+ stick at {path}");
        radios = radios.with_ant(Arc::new(SerialAntPort::new(path)));
    }

    #[cfg(all(target_os = "linux", feature = "companion"))]
    if let Some(selector) = config.mode.companion_adapter() {
        let peripheral = treadbridge::bluez::BluezPeripheral::new(selector).await?;
        radios = radios.with_peripheral(Arc::new(peripheral));
    }

    let mut bridge = FtmsBridge::start(config, radios);
    let mut events = bridge.subscribe();
    info!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(BridgeEvent::Telemetry(t)) => println!(
                    "{:5.2} km/h | pace {} | {:6.2} km | {} | {:4.1} % | {} kcal",
                    t.speed_kmh, t.pace, t.distance_km, t.elapsed, t.incline_percent, t.calories
                ),
                Ok(BridgeEvent::TreadmillConnection(connected)) => {
                    info!("Treadmill {}", if connected { "connected ✅" } else { "disconnected ❌" });
                }
                Ok(BridgeEvent::CompanionConnection(connected)) => {
                    info!("Companion {}", if connected { "connected ✅" } else { "disconnected ❌" });
                }
                Ok(BridgeEvent::Diagnostic(line)) => info!("{line}"),
                Ok(_) => {}
                Err(e) => {
                    error!("Event stream ended: {e}");
                    break;
                }
            },
        }
    }

    info!("Shutting down...");
    bridge.disconnect().await;
    Ok(())
}
