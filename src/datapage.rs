//! ANT+ Stride & Distance Sensor datapages.
//!
//! The encoder turns the latest treadmill metrics into one 8-byte payload per
//! channel transmit event. It owns the rollover accumulators the profile
//! requires; a receiver reconstructs totals by watching them wrap, so they
//! must survive channel restarts and treadmill reconnects.

use crate::types::AntConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

/// Rollover modulus shared by every accumulator
pub const ROLLOVER: f64 = 255.0;

/// Messages in one page rotation before the counter restarts
pub const ROTATION_LENGTH: u32 = 132;

/// Latest treadmill values fed to the encoder
///
/// Totals are `None` until the treadmill has reported them in the current
/// session. The first reported total of a session becomes the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AntInputs {
    /// Instantaneous speed in m/s
    pub speed_mps: f64,
    /// Treadmill total distance in meters
    pub distance_m: Option<f64>,
    /// Treadmill total energy in kcal
    pub calories: Option<u16>,
    /// Treadmill connection this reading belongs to; a change drops the
    /// distance and calorie baselines
    pub session: u64,
}

/// Snapshot of the encoder accumulators
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AntBroadcastState {
    /// Accumulated distance in meters, wraps at 255
    pub distance_accumulator: f64,
    /// Accumulated time in seconds, wraps at 255
    pub time_accumulator: f64,
    /// Stride count, wraps at 255
    pub stride_count: u32,
    /// Accumulated calories, wraps at 255
    pub calorie_accumulator: u32,
    /// Position in the page rotation
    pub message_count: u32,
}

/// One 8-byte ANT+ broadcast payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPage([u8; 8]);

impl DataPage {
    /// Page number (first byte)
    #[must_use]
    pub const fn number(&self) -> u8 {
        self.0[0]
    }

    /// Payload bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

/// Subtract the rollover modulus until the value fits a byte counter
fn wrap(mut value: f64) -> f64 {
    while value > ROLLOVER {
        value -= ROLLOVER;
    }
    value
}

const fn wrap_count(mut value: u32) -> u32 {
    while value > 255 {
        value -= 255;
    }
    value
}

/// Stateful translator from treadmill metrics to Stride & Distance pages
#[derive(Debug, Clone)]
pub struct StrideDistanceEncoder {
    stride_period: f64,
    hardware_revision: u8,
    manufacturer_id: u16,
    model_number: u16,
    software_revision: u8,
    serial_number: u32,

    inputs: AntInputs,
    session: Option<u64>,
    last_distance: Option<f64>,
    last_calories: Option<u16>,
    last_speed: f64,
    last_accumulated_distance: f64,
    stride_time: f64,
    state: AntBroadcastState,
}

impl StrideDistanceEncoder {
    /// Create an encoder for the sensor described by `config`
    #[must_use]
    pub fn new(config: &AntConfig) -> Self {
        let steps_per_minute = if config.cadence_spm > 0.0 {
            config.cadence_spm
        } else {
            160.0
        };
        Self {
            stride_period: 60.0 / (steps_per_minute / 2.0),
            hardware_revision: config.hardware_revision,
            manufacturer_id: config.manufacturer_id,
            model_number: config.model_number,
            software_revision: config.software_revision,
            serial_number: config.serial_number,
            inputs: AntInputs::default(),
            session: None,
            last_distance: None,
            last_calories: None,
            last_speed: 0.0,
            last_accumulated_distance: 0.0,
            stride_time: 0.0,
            state: AntBroadcastState::default(),
        }
    }

    /// Store the latest treadmill values
    ///
    /// The first total reported in every session only sets the baseline, so
    /// a treadmill that reports a large running total does not inject it as
    /// a single distance jump.
    pub fn update(&mut self, inputs: &AntInputs) {
        if self.session != Some(inputs.session) {
            debug!("ANT+ encoder starting session {}", inputs.session);
            self.session = Some(inputs.session);
            self.last_distance = None;
            self.last_calories = None;
        }
        if self.last_distance.is_none() {
            if let Some(distance) = inputs.distance_m {
                debug!("ANT+ distance baseline {distance:.0} m");
                self.last_distance = Some(distance);
            }
        }
        if self.last_calories.is_none() {
            self.last_calories = inputs.calories;
        }
        self.inputs = *inputs;
    }

    /// Accumulator snapshot
    #[must_use]
    pub const fn state(&self) -> AntBroadcastState {
        self.state
    }

    /// Advance the accumulators by `elapsed` and build the next page
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn next_page(&mut self, elapsed: Duration) -> DataPage {
        let elapsed = elapsed.as_secs_f64();
        let speed = self.inputs.speed_mps.max(0.0);

        self.state.message_count += 1;

        let update_latency = wrap_count((elapsed / (1.0 / 32.0)) as u32) as u8;

        if speed > 0.0 {
            self.stride_time += elapsed;
            while self.stride_time >= self.stride_period {
                self.state.stride_count += 1;
                self.stride_time -= self.stride_period;
            }
            self.state.stride_count = wrap_count(self.state.stride_count);
        }

        if let (Some(calories), Some(last)) = (self.inputs.calories, self.last_calories) {
            let delta = calories.saturating_sub(last);
            self.last_calories = Some(calories);
            self.state.calorie_accumulator =
                wrap_count(self.state.calorie_accumulator + u32::from(delta));
        }

        if let (Some(distance), Some(last)) = (self.inputs.distance_m, self.last_distance) {
            let delta = (distance - last).max(0.0);
            self.last_distance = Some(distance);
            self.state.distance_accumulator = wrap(self.state.distance_accumulator + delta);
        }

        #[allow(clippy::float_cmp)]
        let moved = speed != self.last_speed
            || self.state.distance_accumulator != self.last_accumulated_distance;
        if moved {
            self.state.time_accumulator = wrap(self.state.time_accumulator + elapsed);
        }
        self.last_speed = speed;
        self.last_accumulated_distance = self.state.distance_accumulator;

        let count = self.state.message_count;
        let page = if count < 3 {
            self.product_page()
        } else if (67..=68).contains(&count) {
            self.software_page()
        } else {
            let distance_int = self.state.distance_accumulator.trunc();
            let distance_frac = ((self.state.distance_accumulator - distance_int) * 16.0) as u8;
            let speed_int = speed.trunc();
            let speed_frac = ((speed - speed_int) * 256.0) as u8;
            let time_int = self.state.time_accumulator.trunc();
            let time_frac = ((self.state.time_accumulator - time_int) * 200.0) as u8;

            DataPage([
                0x01,
                time_frac,
                time_int as u8,
                distance_int as u8,
                (distance_frac << 4) | (speed_int as u8).min(0x0F),
                speed_frac,
                self.state.stride_count as u8,
                update_latency,
            ])
        };

        if self.state.message_count >= ROTATION_LENGTH {
            self.state.message_count = 0;
        }

        trace!("ANT+ page {} -> {:02X?}", page.number(), page.as_bytes());
        page
    }

    fn product_page(&self) -> DataPage {
        let [manufacturer_lo, manufacturer_hi] = self.manufacturer_id.to_le_bytes();
        let [model_lo, model_hi] = self.model_number.to_le_bytes();
        DataPage([
            80,
            0xFF,
            0xFF,
            self.hardware_revision,
            manufacturer_lo,
            manufacturer_hi,
            model_lo,
            model_hi,
        ])
    }

    fn software_page(&self) -> DataPage {
        let [s0, s1, s2, s3] = self.serial_number.to_le_bytes();
        DataPage([81, 0xFF, 0xFF, self.software_revision, s0, s1, s2, s3])
    }
}
