use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Treadmill link connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No connection attempt in progress
    Idle,
    /// Scanning for a device that advertises FTMS
    Discovering,
    /// Connected, looking up the FTMS service
    ServiceResolving,
    /// Resolving characteristics and enabling notifications
    CharacteristicSetup,
    /// Notifications flowing, control point writable
    Subscribed,
    /// Still connected but the last control point write failed
    Degraded,
    /// Link lost or closed
    Disconnected,
}

impl LinkState {
    /// Whether the link is connected to a treadmill with notifications enabled
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Subscribed | Self::Degraded)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Discovering => write!(f, "Discovering"),
            Self::ServiceResolving => write!(f, "Service resolving"),
            Self::CharacteristicSetup => write!(f, "Characteristic setup"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Companion link advertising state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompanionState {
    /// GATT server not published
    Stopped,
    /// Published and advertising, no companion connected
    Advertising,
    /// A companion is connected
    Connected,
}

impl fmt::Display for CompanionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Advertising => write!(f, "Advertising"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Expended energy block of a treadmill data notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyReading {
    /// Total energy in kcal
    pub total: u16,
    /// Energy per hour in kcal
    pub per_hour: u16,
    /// Energy per minute in kcal
    pub per_minute: u8,
}

/// Positive and negative elevation gain, 0.1 m resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationGain {
    /// Positive elevation gain
    pub positive: u16,
    /// Negative elevation gain
    pub negative: u16,
}

/// Force on belt (N) and power output (W)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeltPower {
    /// Force on belt in newtons
    pub force_on_belt: i16,
    /// Power output in watts
    pub power_output: i16,
}

/// One parsed FTMS Treadmill Data notification
///
/// Values keep their FTMS fixed-point units. A field is `None` when its
/// flag bit was not set on the wire; absent is never the same as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreadmillSample {
    /// Instantaneous speed, 0.01 km/h
    pub instantaneous_speed: Option<u16>,
    /// Average speed, 0.01 km/h
    pub average_speed: Option<u16>,
    /// Total distance in meters (uint24 on the wire)
    pub total_distance: Option<u32>,
    /// Inclination, 0.1 %
    pub inclination: Option<i16>,
    /// Ramp angle setting, 0.1 degree
    pub ramp_angle: Option<i16>,
    /// Elevation gain
    pub elevation_gain: Option<ElevationGain>,
    /// Instantaneous pace, 0.1 km/min
    pub instantaneous_pace: Option<u8>,
    /// Average pace, 0.1 km/min
    pub average_pace: Option<u8>,
    /// Expended energy
    pub energy: Option<EnergyReading>,
    /// Heart rate in beats per minute
    pub heart_rate: Option<u8>,
    /// Metabolic equivalent, 0.1 resolution
    pub metabolic_equivalent: Option<u8>,
    /// Elapsed time in seconds
    pub elapsed_time: Option<u16>,
    /// Remaining time in seconds
    pub remaining_time: Option<u16>,
    /// Force on belt and power output
    pub belt_power: Option<BeltPower>,
}

impl TreadmillSample {
    /// Snapshot served by the companion before any treadmill data arrived:
    /// speed, distance, inclination, energy, heart rate and elapsed time
    /// present and all zero.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            instantaneous_speed: Some(0),
            average_speed: None,
            total_distance: Some(0),
            inclination: Some(0),
            ramp_angle: Some(0),
            elevation_gain: None,
            instantaneous_pace: None,
            average_pace: None,
            energy: Some(EnergyReading {
                total: 0,
                per_hour: 0,
                per_minute: 0,
            }),
            heart_rate: Some(0),
            metabolic_equivalent: None,
            elapsed_time: Some(0),
            remaining_time: None,
            belt_power: None,
        }
    }

    /// Instantaneous speed in km/h
    #[must_use]
    pub fn speed_kmh(&self) -> Option<f64> {
        self.instantaneous_speed.map(|v| f64::from(v) / 100.0)
    }

    /// Instantaneous speed in m/s
    #[must_use]
    pub fn speed_mps(&self) -> Option<f64> {
        self.instantaneous_speed.map(|v| f64::from(v) / 360.0)
    }

    /// Inclination in percent
    #[must_use]
    pub fn incline_percent(&self) -> Option<f64> {
        self.inclination.map(|v| f64::from(v) / 10.0)
    }

    /// Total expended energy in kcal
    #[must_use]
    pub fn calories(&self) -> Option<u16> {
        self.energy.map(|e| e.total)
    }
}

/// Fitness Machine Status notification, forwarded unmodified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStatus(pub(crate) Bytes);

impl MachineStatus {
    /// Snapshot served by the companion before any status arrived
    #[must_use]
    pub const fn idle() -> Self {
        Self(Bytes::from_static(&[0x00]))
    }

    /// Status op code (first byte)
    #[must_use]
    pub fn op_code(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// Raw payload
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

/// Training Status notification, forwarded unmodified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingStatus(pub(crate) Bytes);

impl TrainingStatus {
    /// Snapshot served by the companion before any status arrived: no
    /// string present, status Idle
    #[must_use]
    pub const fn idle() -> Self {
        Self(Bytes::from_static(&[0x00, 0x01]))
    }

    /// Flags byte
    #[must_use]
    pub fn flags(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// Training status code, if transmitted
    #[must_use]
    pub fn status(&self) -> Option<u8> {
        self.0.get(1).copied()
    }

    /// Raw payload
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

/// Human-facing view of a treadmill sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Speed in km/h
    pub speed_kmh: f64,
    /// Pace per kilometer, `MM:SS`
    pub pace: String,
    /// Distance in km
    pub distance_km: f64,
    /// Elapsed time, `MM:SS` or `H:MM:SS`
    pub elapsed: String,
    /// Inclination in percent
    pub incline_percent: f64,
    /// Total calories in kcal
    pub calories: u16,
}

impl From<&TreadmillSample> for Telemetry {
    fn from(sample: &TreadmillSample) -> Self {
        let speed_kmh = sample.speed_kmh().unwrap_or(0.0);
        Self {
            speed_kmh,
            pace: format_pace(speed_kmh),
            distance_km: f64::from(sample.total_distance.unwrap_or(0)) / 1000.0,
            elapsed: format_elapsed(u32::from(sample.elapsed_time.unwrap_or(0))),
            incline_percent: sample.incline_percent().unwrap_or(0.0),
            calories: sample.calories().unwrap_or(0),
        }
    }
}

/// Format the pace for `speed_kmh` as minutes and seconds per kilometer
///
/// Returns `"00:00"` when the belt is not moving.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_pace(speed_kmh: f64) -> String {
    if speed_kmh <= 0.0 {
        return "00:00".to_string();
    }
    let seconds_per_km = (3600.0 / speed_kmh) as u64;
    format!("{:02}:{:02}", seconds_per_km / 60, seconds_per_km % 60)
}

/// Format elapsed seconds as `MM:SS`, or `H:MM:SS` from one hour on
#[must_use]
pub fn format_elapsed(seconds: u32) -> String {
    if seconds < 3600 {
        format!("{:02}:{:02}", seconds / 60, seconds % 60)
    } else {
        format!(
            "{}:{:02}:{:02}",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}

/// Selects a local Bluetooth adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterSelector {
    /// Position in the platform's adapter list
    Index(usize),
    /// Adapter name (for example `hci1`), matched against the adapter info
    Name(String),
}

impl Default for AdapterSelector {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl fmt::Display for AdapterSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "adapter #{index}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Which radio adapter serves which role, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterMode {
    /// Treadmill link only; no companion peripheral
    ClientOnly {
        /// Adapter used for the treadmill link
        treadmill: AdapterSelector,
    },
    /// Treadmill link plus companion peripheral
    ClientPlusServer {
        /// Adapter used for the treadmill link
        treadmill: AdapterSelector,
        /// Adapter used for the companion peripheral (may equal `treadmill`)
        companion: AdapterSelector,
    },
}

impl AdapterMode {
    /// Adapter serving the treadmill link
    #[must_use]
    pub const fn treadmill_adapter(&self) -> &AdapterSelector {
        match self {
            Self::ClientOnly { treadmill } | Self::ClientPlusServer { treadmill, .. } => treadmill,
        }
    }

    /// Adapter serving the companion link, if any
    #[must_use]
    pub const fn companion_adapter(&self) -> Option<&AdapterSelector> {
        match self {
            Self::ClientOnly { .. } => None,
            Self::ClientPlusServer { companion, .. } => Some(companion),
        }
    }
}

impl Default for AdapterMode {
    fn default() -> Self {
        Self::ClientOnly {
            treadmill: AdapterSelector::default(),
        }
    }
}

/// Treadmill link parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreadmillLinkConfig {
    /// Discovery window in milliseconds
    pub discovery_timeout_ms: u64,
    /// Pause after each control point write in milliseconds
    pub write_pacing_ms: u64,
    /// Address never connected to (our own companion adapter)
    pub blacklist_address: Option<String>,
}

impl Default for TreadmillLinkConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: 5_000,
            write_pacing_ms: 250,
            blacklist_address: None,
        }
    }
}

/// Companion peripheral profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionConfig {
    /// Advertised local name
    pub local_name: String,
    /// Device Information: manufacturer name
    pub manufacturer: String,
    /// Device Information: model number
    pub model_number: String,
    /// Device Information: serial number
    pub serial_number: String,
    /// Device Information: hardware revision
    pub hardware_revision: String,
    /// Device Information: firmware revision
    pub firmware_revision: String,
    /// Device Information: software revision
    pub software_revision: String,
    /// Cache push interval in milliseconds
    pub notify_interval_ms: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            local_name: "BLE_Bridge".to_string(),
            manufacturer: "BLE_Bridge".to_string(),
            model_number: "2".to_string(),
            serial_number: "1234".to_string(),
            hardware_revision: "1.0".to_string(),
            firmware_revision: "1.0".to_string(),
            software_revision: "1.0".to_string(),
            notify_interval_ms: 500,
        }
    }
}

/// ANT+ Stride & Distance Sensor channel parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntConfig {
    /// ANT+ network key
    pub network_key: [u8; 8],
    /// Channel number on the stick
    pub channel: u8,
    /// Network number the key is loaded into
    pub network: u8,
    /// Device number in the channel id
    pub device_number: u16,
    /// Device type (124 = Stride & Distance Sensor)
    pub device_type: u8,
    /// Transmission type
    pub transmission_type: u8,
    /// Channel period in 1/32768 s
    pub channel_period: u16,
    /// RF frequency offset from 2400 MHz
    pub rf_frequency: u8,
    /// Assumed cadence in steps per minute, drives the virtual stride count
    pub cadence_spm: f64,
    /// Page 80: hardware revision
    pub hardware_revision: u8,
    /// Page 80: manufacturer id
    pub manufacturer_id: u16,
    /// Page 80: model number
    pub model_number: u16,
    /// Page 81: software revision
    pub software_revision: u8,
    /// Page 81: serial number
    pub serial_number: u32,
    /// How long to wait for each configuration response in milliseconds
    pub command_timeout_ms: u64,
    /// Pause before reopening the channel after a failure in milliseconds
    pub restart_delay_ms: u64,
}

impl Default for AntConfig {
    fn default() -> Self {
        Self {
            network_key: [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45],
            channel: 0,
            network: 0,
            device_number: 12_345,
            device_type: 124,
            transmission_type: 5,
            channel_period: 8_134,
            rf_frequency: 57,
            cadence_spm: 160.0,
            hardware_revision: 1,
            manufacturer_id: 0x0101,
            model_number: 0x0101,
            software_revision: 1,
            serial_number: 0xFFFF_FFFF,
            command_timeout_ms: 1_000,
            restart_delay_ms: 1_000,
        }
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Adapter role assignment
    pub mode: AdapterMode,
    /// Treadmill link parameters
    pub treadmill: TreadmillLinkConfig,
    /// Companion peripheral profile
    pub companion: CompanionConfig,
    /// ANT+ channel parameters
    pub ant: AntConfig,
    /// Coordinator timing
    pub timing: CoordinatorTiming,
}

/// Delays used by the bridge coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorTiming {
    /// Wait before the single automatic treadmill reconnect in milliseconds
    pub reconnect_delay_ms: u64,
    /// Wait before rebuilding the companion after it disconnects in milliseconds
    pub companion_rebuild_delay_ms: u64,
    /// Gap between the commands of the stop sequence in milliseconds
    pub stop_sequence_gap_ms: u64,
}

impl Default for CoordinatorTiming {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 2_000,
            companion_rebuild_delay_ms: 1_000,
            stop_sequence_gap_ms: 250,
        }
    }
}
