#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Treadbridge 🏃‍♀️📡
//!
//! Bridge a Bluetooth Low Energy treadmill that speaks the standard
//! Fitness Machine Service (FTMS) to an ANT+ Stride & Distance Sensor
//! broadcast, and optionally re-expose the same treadmill as a second BLE
//! peripheral for a companion device (a sports watch that only sees one
//! FTMS source at a time, or cannot pair with the treadmill directly).
//!
//! ## Architecture
//!
//! Three links run concurrently, each in its own tokio task, and only ever
//! talk to each other through typed events:
//!
//! - **Treadmill link** ([`ble::TreadmillLink`]): BLE central role. Discovers
//!   the treadmill, resolves the FTMS service, subscribes to its
//!   notifications and owns the single write path to the control point.
//! - **Companion link** ([`companion::CompanionLink`]): BLE peripheral role.
//!   Advertises a clone of the FTMS service and mirrors cached telemetry to a
//!   connected companion every 500 ms.
//! - **ANT+ link** ([`ant::AntLink`]): configures an ANT USB stick as a Stride
//!   & Distance Sensor master and answers every transmit event with the next
//!   datapage from [`datapage::StrideDistanceEncoder`].
//!
//! The [`bridge::FtmsBridge`] coordinator wires these together, supervises
//! reconnects, and hands telemetry, connection state and diagnostics to the
//! presentation layer.
//!
//! ## Radio back-ends
//!
//! Every radio sits behind a small async trait so the state machines can be
//! exercised without hardware:
//!
//! | Role | Trait | Hardware back-end | Test back-end |
//! |------|-------|-------------------|---------------|
//! | Central | [`ble::CentralRadio`] | [`ble::BtleplugCentral`] | [`mock::MockCentral`] |
//! | Peripheral | [`companion::PeripheralRadio`] | `bluez::BluezPeripheral` (Linux) | [`mock::MockPeripheralRadio`] |
//! | ANT+ | [`ant::AntPort`] | [`ant::SerialAntPort`] | [`mock::MockAntStick`] |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use treadbridge::{
//!     ble::BtleplugCentral, bridge::{BridgeRadios, FtmsBridge}, AdapterSelector, BridgeConfig,
//!     BridgeEvent,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::default();
//!     let central = BtleplugCentral::new(&AdapterSelector::Index(0)).await?;
//!     let radios = BridgeRadios::central_only(Arc::new(central));
//!
//!     let bridge = FtmsBridge::start(config, radios);
//!     let mut events = bridge.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         if let BridgeEvent::Telemetry(t) = event {
//!             println!("{:.2} km/h, pace {}", t.speed_kmh, t.pace);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// ANT+ serial framing, channel configuration and broadcast loop
pub mod ant;
/// Treadmill link: BLE central role
pub mod ble;
/// Companion peripheral back-end on BlueZ
#[cfg(all(target_os = "linux", feature = "companion"))]
pub mod bluez;
/// Bridge coordinator and presentation-facing API
pub mod bridge;
/// Companion link: BLE peripheral role
pub mod companion;
/// ANT+ Stride & Distance datapage encoder
pub mod datapage;
/// Error types and handling
pub mod error;
/// FTMS payload codec
pub mod ftms;
/// In-memory radio back-ends for tests and simulations
pub mod mock;
/// Type definitions and data structures
pub mod types;

pub use bridge::{BridgeEvent, FtmsBridge};
pub use error::{BridgeError, CodecError, Result};
pub use ftms::{ControlCommand, StopKind};
pub use types::{
    AdapterMode, AdapterSelector, AntConfig, BridgeConfig, CompanionConfig, CompanionState,
    CoordinatorTiming, LinkState, MachineStatus, Telemetry, TrainingStatus, TreadmillLinkConfig,
    TreadmillSample,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Expand a 16-bit Bluetooth SIG short UUID onto the Bluetooth base UUID
/// `0000XXXX-0000-1000-8000-00805F9B34FB`.
#[must_use]
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB_u128)
}

/// Fitness Machine Service
pub const FTMS_SERVICE_UUID: Uuid = ble_uuid(0x1826);

/// Fitness Machine Feature (read)
pub const FEATURE_UUID: Uuid = ble_uuid(0x2ACC);

/// Treadmill Data (notify)
pub const TREADMILL_DATA_UUID: Uuid = ble_uuid(0x2ACD);

/// Training Status (read, notify)
pub const TRAINING_STATUS_UUID: Uuid = ble_uuid(0x2AD3);

/// Supported Speed Range (read)
pub const SPEED_RANGE_UUID: Uuid = ble_uuid(0x2AD4);

/// Supported Inclination Range (read)
pub const INCLINE_RANGE_UUID: Uuid = ble_uuid(0x2AD5);

/// Fitness Machine Control Point (write)
pub const CONTROL_POINT_UUID: Uuid = ble_uuid(0x2AD9);

/// Fitness Machine Status (notify)
pub const MACHINE_STATUS_UUID: Uuid = ble_uuid(0x2ADA);

/// Device Information service, exposed only by the companion profile
pub const DEVICE_INFORMATION_UUID: Uuid = ble_uuid(0x180A);

/// Device Information: Manufacturer Name String
pub const MANUFACTURER_NAME_UUID: Uuid = ble_uuid(0x2A29);

/// Device Information: Model Number String
pub const MODEL_NUMBER_UUID: Uuid = ble_uuid(0x2A24);

/// Device Information: Serial Number String
pub const SERIAL_NUMBER_UUID: Uuid = ble_uuid(0x2A25);

/// Device Information: Firmware Revision String
pub const FIRMWARE_REVISION_UUID: Uuid = ble_uuid(0x2A26);

/// Device Information: Hardware Revision String
pub const HARDWARE_REVISION_UUID: Uuid = ble_uuid(0x2A27);

/// Device Information: Software Revision String
pub const SOFTWARE_REVISION_UUID: Uuid = ble_uuid(0x2A28);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            FTMS_SERVICE_UUID,
            Uuid::parse_str("00001826-0000-1000-8000-00805f9b34fb").unwrap()
        );
        assert_eq!(
            CONTROL_POINT_UUID,
            Uuid::parse_str("00002AD9-0000-1000-8000-00805F9B34FB").unwrap()
        );
    }
}
