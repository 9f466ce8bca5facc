//! Encoding and decoding of Fitness Machine Service payloads.
//!
//! All multi-byte fields are little-endian. Treadmill Data is a 16-bit flags
//! word followed by the fields its bits announce, in the order of the bit
//! numbers below. Every decoder is pure and never panics on short input.

use crate::{
    error::CodecError,
    types::{BeltPower, ElevationGain, EnergyReading, MachineStatus, TrainingStatus, TreadmillSample},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Instantaneous speed is *absent* when this bit is set
pub const FLAG_MORE_DATA: u16 = 1 << 0;
/// Average speed present
pub const FLAG_AVERAGE_SPEED: u16 = 1 << 1;
/// Total distance present
pub const FLAG_TOTAL_DISTANCE: u16 = 1 << 2;
/// Inclination and ramp angle present
pub const FLAG_INCLINATION: u16 = 1 << 3;
/// Positive and negative elevation gain present
pub const FLAG_ELEVATION_GAIN: u16 = 1 << 4;
/// Instantaneous pace present
pub const FLAG_INSTANTANEOUS_PACE: u16 = 1 << 5;
/// Average pace present
pub const FLAG_AVERAGE_PACE: u16 = 1 << 6;
/// Expended energy block present
pub const FLAG_EXPENDED_ENERGY: u16 = 1 << 7;
/// Heart rate present
pub const FLAG_HEART_RATE: u16 = 1 << 8;
/// Metabolic equivalent present
pub const FLAG_METABOLIC_EQUIVALENT: u16 = 1 << 9;
/// Elapsed time present
pub const FLAG_ELAPSED_TIME: u16 = 1 << 10;
/// Remaining time present
pub const FLAG_REMAINING_TIME: u16 = 1 << 11;
/// Force on belt and power output present
pub const FLAG_FORCE_AND_POWER: u16 = 1 << 12;

/// Fitness Machine Control Point op codes used by a treadmill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Take control of the machine
    RequestControl = 0x00,
    /// Reset the machine
    Reset = 0x01,
    /// Target speed in 0.01 km/h
    SetTargetSpeed = 0x02,
    /// Target inclination in 0.1 %
    SetTargetIncline = 0x03,
    /// Start or resume
    StartResume = 0x07,
    /// Stop or pause, selected by a parameter byte
    StopPause = 0x08,
}

impl OpCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x02 => Some(Self::SetTargetSpeed),
            0x03 => Some(Self::SetTargetIncline),
            0x07 => Some(Self::StartResume),
            0x08 => Some(Self::StopPause),
            _ => None,
        }
    }
}

/// Parameter of the Stop/Pause op code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopKind {
    /// End the workout
    Stop = 0x01,
    /// Pause the belt
    Pause = 0x02,
}

/// A treadmill control point command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Request control of the machine
    RequestControl,
    /// Reset the machine
    Reset,
    /// Target speed in 0.01 km/h
    SetTargetSpeed(u16),
    /// Target inclination in 0.1 %
    SetTargetIncline(i16),
    /// Start or resume the belt
    Start,
    /// Stop or pause the belt
    Stop(StopKind),
}

impl ControlCommand {
    /// Op code this command is written with
    #[must_use]
    pub const fn op_code(self) -> OpCode {
        match self {
            Self::RequestControl => OpCode::RequestControl,
            Self::Reset => OpCode::Reset,
            Self::SetTargetSpeed(_) => OpCode::SetTargetSpeed,
            Self::SetTargetIncline(_) => OpCode::SetTargetIncline,
            Self::Start => OpCode::StartResume,
            Self::Stop(_) => OpCode::StopPause,
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestControl => write!(f, "request control"),
            Self::Reset => write!(f, "reset"),
            Self::SetTargetSpeed(speed) => {
                write!(f, "set speed {}.{:02} km/h", speed / 100, speed % 100)
            }
            Self::SetTargetIncline(incline) => {
                write!(f, "set incline {:.1} %", f64::from(*incline) / 10.0)
            }
            Self::Start => write!(f, "start"),
            Self::Stop(StopKind::Stop) => write!(f, "stop"),
            Self::Stop(StopKind::Pause) => write!(f, "pause"),
        }
    }
}

/// Reads flag-gated fields while tracking how many bytes the flags demanded
struct FieldReader<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> FieldReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            total: buf.len(),
        }
    }

    fn require(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::TruncatedPayload {
                needed: self.total - self.buf.remaining() + n,
                actual: self.total,
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.require(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn i16(&mut self) -> Result<i16, CodecError> {
        self.require(2)?;
        Ok(self.buf.get_i16_le())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn u24(&mut self) -> Result<u32, CodecError> {
        self.require(3)?;
        Ok(self.buf.get_uint_le(3) as u32)
    }
}

/// Parse a Treadmill Data notification
///
/// # Errors
///
/// Returns [`CodecError::TruncatedPayload`] when the payload is shorter than
/// its flags require.
pub fn decode_treadmill_data(data: &[u8]) -> Result<TreadmillSample, CodecError> {
    let mut r = FieldReader::new(data);
    let flags = r.u16()?;
    let has = |bit: u16| flags & bit != 0;

    let mut sample = TreadmillSample::default();

    if !has(FLAG_MORE_DATA) {
        sample.instantaneous_speed = Some(r.u16()?);
    }
    if has(FLAG_AVERAGE_SPEED) {
        sample.average_speed = Some(r.u16()?);
    }
    if has(FLAG_TOTAL_DISTANCE) {
        sample.total_distance = Some(r.u24()?);
    }
    if has(FLAG_INCLINATION) {
        sample.inclination = Some(r.i16()?);
        sample.ramp_angle = Some(r.i16()?);
    }
    if has(FLAG_ELEVATION_GAIN) {
        sample.elevation_gain = Some(ElevationGain {
            positive: r.u16()?,
            negative: r.u16()?,
        });
    }
    if has(FLAG_INSTANTANEOUS_PACE) {
        sample.instantaneous_pace = Some(r.u8()?);
    }
    if has(FLAG_AVERAGE_PACE) {
        sample.average_pace = Some(r.u8()?);
    }
    if has(FLAG_EXPENDED_ENERGY) {
        sample.energy = Some(EnergyReading {
            total: r.u16()?,
            per_hour: r.u16()?,
            per_minute: r.u8()?,
        });
    }
    if has(FLAG_HEART_RATE) {
        sample.heart_rate = Some(r.u8()?);
    }
    if has(FLAG_METABOLIC_EQUIVALENT) {
        sample.metabolic_equivalent = Some(r.u8()?);
    }
    if has(FLAG_ELAPSED_TIME) {
        sample.elapsed_time = Some(r.u16()?);
    }
    if has(FLAG_REMAINING_TIME) {
        sample.remaining_time = Some(r.u16()?);
    }
    if has(FLAG_FORCE_AND_POWER) {
        sample.belt_power = Some(BeltPower {
            force_on_belt: r.i16()?,
            power_output: r.i16()?,
        });
    }

    Ok(sample)
}

/// Flags word describing which fields of `sample` are present
#[must_use]
pub const fn treadmill_flags(sample: &TreadmillSample) -> u16 {
    let mut flags = 0;
    if sample.instantaneous_speed.is_none() {
        flags |= FLAG_MORE_DATA;
    }
    if sample.average_speed.is_some() {
        flags |= FLAG_AVERAGE_SPEED;
    }
    if sample.total_distance.is_some() {
        flags |= FLAG_TOTAL_DISTANCE;
    }
    if sample.inclination.is_some() {
        flags |= FLAG_INCLINATION;
    }
    if sample.elevation_gain.is_some() {
        flags |= FLAG_ELEVATION_GAIN;
    }
    if sample.instantaneous_pace.is_some() {
        flags |= FLAG_INSTANTANEOUS_PACE;
    }
    if sample.average_pace.is_some() {
        flags |= FLAG_AVERAGE_PACE;
    }
    if sample.energy.is_some() {
        flags |= FLAG_EXPENDED_ENERGY;
    }
    if sample.heart_rate.is_some() {
        flags |= FLAG_HEART_RATE;
    }
    if sample.metabolic_equivalent.is_some() {
        flags |= FLAG_METABOLIC_EQUIVALENT;
    }
    if sample.elapsed_time.is_some() {
        flags |= FLAG_ELAPSED_TIME;
    }
    if sample.remaining_time.is_some() {
        flags |= FLAG_REMAINING_TIME;
    }
    if sample.belt_power.is_some() {
        flags |= FLAG_FORCE_AND_POWER;
    }
    flags
}

/// Serialize a sample back into a Treadmill Data notification
///
/// Inclination and ramp angle share one flag; a missing ramp angle is
/// written as zero.
#[must_use]
pub fn encode_treadmill_data(sample: &TreadmillSample) -> Bytes {
    let mut buf = BytesMut::with_capacity(40);
    buf.put_u16_le(treadmill_flags(sample));

    if let Some(speed) = sample.instantaneous_speed {
        buf.put_u16_le(speed);
    }
    if let Some(average) = sample.average_speed {
        buf.put_u16_le(average);
    }
    if let Some(distance) = sample.total_distance {
        buf.put_uint_le(u64::from(distance & 0x00FF_FFFF), 3);
    }
    if let Some(inclination) = sample.inclination {
        buf.put_i16_le(inclination);
        buf.put_i16_le(sample.ramp_angle.unwrap_or(0));
    }
    if let Some(gain) = sample.elevation_gain {
        buf.put_u16_le(gain.positive);
        buf.put_u16_le(gain.negative);
    }
    if let Some(pace) = sample.instantaneous_pace {
        buf.put_u8(pace);
    }
    if let Some(pace) = sample.average_pace {
        buf.put_u8(pace);
    }
    if let Some(energy) = sample.energy {
        buf.put_u16_le(energy.total);
        buf.put_u16_le(energy.per_hour);
        buf.put_u8(energy.per_minute);
    }
    if let Some(heart_rate) = sample.heart_rate {
        buf.put_u8(heart_rate);
    }
    if let Some(met) = sample.metabolic_equivalent {
        buf.put_u8(met);
    }
    if let Some(elapsed) = sample.elapsed_time {
        buf.put_u16_le(elapsed);
    }
    if let Some(remaining) = sample.remaining_time {
        buf.put_u16_le(remaining);
    }
    if let Some(power) = sample.belt_power {
        buf.put_i16_le(power.force_on_belt);
        buf.put_i16_le(power.power_output);
    }

    buf.freeze()
}

/// Serialize a control point command
#[must_use]
pub fn encode_control_point(command: ControlCommand) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(command.op_code() as u8);
    match command {
        ControlCommand::SetTargetSpeed(speed) => buf.put_u16_le(speed),
        ControlCommand::SetTargetIncline(incline) => buf.put_i16_le(incline),
        ControlCommand::Stop(kind) => buf.put_u8(kind as u8),
        ControlCommand::RequestControl | ControlCommand::Reset | ControlCommand::Start => {}
    }
    buf.freeze()
}

/// Parse a control point write
///
/// # Errors
///
/// Returns [`CodecError::EmptyPayload`] for an empty write,
/// [`CodecError::UnknownOpCode`] outside the treadmill subset,
/// [`CodecError::TruncatedPayload`] when a parameter is missing and
/// [`CodecError::InvalidParameter`] for an unknown stop/pause selector.
pub fn decode_control_point(data: &[u8]) -> Result<ControlCommand, CodecError> {
    let mut r = FieldReader::new(data);
    let raw = r.u8().map_err(|_| CodecError::EmptyPayload)?;
    let op = OpCode::from_u8(raw).ok_or(CodecError::UnknownOpCode(raw))?;

    Ok(match op {
        OpCode::RequestControl => ControlCommand::RequestControl,
        OpCode::Reset => ControlCommand::Reset,
        OpCode::SetTargetSpeed => ControlCommand::SetTargetSpeed(r.u16()?),
        OpCode::SetTargetIncline => ControlCommand::SetTargetIncline(r.i16()?),
        OpCode::StartResume => ControlCommand::Start,
        OpCode::StopPause => match r.u8()? {
            0x01 => ControlCommand::Stop(StopKind::Stop),
            0x02 => ControlCommand::Stop(StopKind::Pause),
            value => {
                return Err(CodecError::InvalidParameter {
                    opcode: raw,
                    value,
                })
            }
        },
    })
}

/// Wrap a Fitness Machine Status notification
///
/// # Errors
///
/// Returns [`CodecError::EmptyPayload`] for an empty notification.
pub fn decode_status(data: &[u8]) -> Result<MachineStatus, CodecError> {
    if data.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    Ok(MachineStatus(Bytes::copy_from_slice(data)))
}

/// Wrap a Training Status notification
///
/// # Errors
///
/// Returns [`CodecError::EmptyPayload`] for an empty notification.
pub fn decode_training_status(data: &[u8]) -> Result<TrainingStatus, CodecError> {
    if data.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    Ok(TrainingStatus(Bytes::copy_from_slice(data)))
}

/// Fitness machine features advertised by the companion: average speed,
/// total distance, inclination, expended energy, heart rate, elapsed time
pub const COMPANION_MACHINE_FEATURES: u32 = 0x0000_160D;

/// Target settings advertised by the companion: speed and inclination
pub const COMPANION_TARGET_FEATURES: u32 = 0x0000_0003;

/// Serialize the Fitness Machine Feature characteristic
#[must_use]
pub fn encode_feature(machine_features: u32, target_features: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(machine_features);
    buf.put_u32_le(target_features);
    buf.freeze()
}

/// Serialize the Supported Speed Range characteristic (0.01 km/h units)
#[must_use]
pub fn encode_speed_range(minimum: u16, maximum: u16, increment: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u16_le(minimum);
    buf.put_u16_le(maximum);
    buf.put_u16_le(increment);
    buf.freeze()
}

/// Serialize the Supported Inclination Range characteristic (0.1 % units)
#[must_use]
pub fn encode_incline_range(minimum: i16, maximum: i16, increment: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_i16_le(minimum);
    buf.put_i16_le(maximum);
    buf.put_u16_le(increment);
    buf.freeze()
}
