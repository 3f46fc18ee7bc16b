//! WitMotion telemetry framing and command encoding.
//!
//! The IMU streams fixed 11-byte frames:
//!
//! ```text
//! 0x55 | type | d0 d1 d2 d3 d4 d5 d6 d7 | checksum
//! ```
//!
//! `checksum` is the low byte of the sum of `type` and the eight payload
//! bytes. Axis values are little-endian `i16` pairs in `d0..d6`, scaled by a
//! per-kind factor taken from [`SCALE_TABLE`].
//!
//! The link is noisy and reads arrive in arbitrary chunks, so the
//! [`FrameDecoder`] keeps an accumulator across calls and resynchronises one
//! byte at a time after a bad checksum.

use std::fmt;
use std::str::FromStr;

use log::{debug, trace};

use crate::errors::DecodeAnomaly;

// ============================================================================
// Constants
// ============================================================================

/// Start marker of every telemetry frame.
pub const START_MARKER: u8 = 0x55;

/// Full frame length: start + type + 8 payload bytes + checksum.
pub const FRAME_LEN: usize = 11;

const PAYLOAD_LEN: usize = 8;

const TAG_ACCELERATION: u8 = 0x51;
const TAG_ANGULAR_VELOCITY: u8 = 0x52;
const TAG_ANGLE: u8 = 0x53;
const TAG_MAGNETOMETER: u8 = 0x54;

// ============================================================================
// Readings
// ============================================================================

/// A three-axis value in the physical unit of its reading kind.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean norm, `sqrt(x² + y² + z²)`.
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Kinds of frames this decoder knows how to scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingKind {
    /// 0x51, in g
    Acceleration,
    /// 0x52, in degrees per second
    AngularVelocity,
    /// 0x53, roll/pitch/yaw in degrees
    Angle,
    /// 0x54, raw magnetometer counts
    Magnetometer,
}

impl ReadingKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_ACCELERATION => Some(ReadingKind::Acceleration),
            TAG_ANGULAR_VELOCITY => Some(ReadingKind::AngularVelocity),
            TAG_ANGLE => Some(ReadingKind::Angle),
            TAG_MAGNETOMETER => Some(ReadingKind::Magnetometer),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            ReadingKind::Acceleration => TAG_ACCELERATION,
            ReadingKind::AngularVelocity => TAG_ANGULAR_VELOCITY,
            ReadingKind::Angle => TAG_ANGLE,
            ReadingKind::Magnetometer => TAG_MAGNETOMETER,
        }
    }

    /// Scale entry for this kind.
    pub fn scale(self) -> &'static Scale {
        // Table is exhaustive over the enum; see `scale_table_covers_every_kind`.
        SCALE_TABLE
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, scale)| scale)
            .unwrap_or(&UNIT_SCALE)
    }
}

/// Conversion from raw `i16` counts to a physical unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    /// Physical value of one least-significant bit.
    pub per_lsb: f64,
    pub unit: &'static str,
}

impl Scale {
    pub fn apply(&self, raw: i16) -> f64 {
        raw as f64 * self.per_lsb
    }
}

const RAW_FULL_SCALE: f64 = 32768.0;

const UNIT_SCALE: Scale = Scale {
    per_lsb: 1.0,
    unit: "LSB",
};

/// Scale factors by reading kind. Full-scale ranges follow the module's
/// factory configuration (±16 g, ±2000 °/s, ±180 °).
pub static SCALE_TABLE: [(ReadingKind, Scale); 4] = [
    (
        ReadingKind::Acceleration,
        Scale {
            per_lsb: 16.0 / RAW_FULL_SCALE,
            unit: "g",
        },
    ),
    (
        ReadingKind::AngularVelocity,
        Scale {
            per_lsb: 2000.0 / RAW_FULL_SCALE,
            unit: "deg/s",
        },
    ),
    (
        ReadingKind::Angle,
        Scale {
            per_lsb: 180.0 / RAW_FULL_SCALE,
            unit: "deg",
        },
    ),
    (ReadingKind::Magnetometer, UNIT_SCALE),
];

/// A decoded, typed measurement extracted from one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Acceleration(Vector3),
    AngularVelocity(Vector3),
    Angle(Vector3),
    Magnetometer(Vector3),
    /// Valid frame with a type tag this decoder does not interpret.
    Unsupported(u8),
}

impl Reading {
    pub fn kind(&self) -> Option<ReadingKind> {
        match self {
            Reading::Acceleration(_) => Some(ReadingKind::Acceleration),
            Reading::AngularVelocity(_) => Some(ReadingKind::AngularVelocity),
            Reading::Angle(_) => Some(ReadingKind::Angle),
            Reading::Magnetometer(_) => Some(ReadingKind::Magnetometer),
            Reading::Unsupported(_) => None,
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Low byte of the sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Build a complete frame for `tag` and `payload`, checksum included.
pub fn encode_frame(tag: u8, payload: [u8; PAYLOAD_LEN]) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = START_MARKER;
    frame[1] = tag;
    frame[2..2 + PAYLOAD_LEN].copy_from_slice(&payload);
    frame[FRAME_LEN - 1] = checksum(&frame[1..FRAME_LEN - 1]);
    frame
}

/// Frame carrying three raw axis values (the trailing two payload bytes are zero).
pub fn encode_axes(tag: u8, raw: [i16; 3]) -> [u8; FRAME_LEN] {
    let mut payload = [0u8; PAYLOAD_LEN];
    for (i, value) in raw.iter().enumerate() {
        payload[2 * i..2 * i + 2].copy_from_slice(&value.to_le_bytes());
    }
    encode_frame(tag, payload)
}

struct RawFrame {
    tag: u8,
    payload: [u8; PAYLOAD_LEN],
}

impl RawFrame {
    /// Validate a candidate that starts with the start marker.
    fn parse(candidate: &[u8]) -> Result<Self, DecodeAnomaly> {
        let expected = checksum(&candidate[1..FRAME_LEN - 1]);
        let actual = candidate[FRAME_LEN - 1];
        if expected != actual {
            return Err(DecodeAnomaly::ChecksumMismatch { expected, actual });
        }
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&candidate[2..2 + PAYLOAD_LEN]);
        Ok(Self {
            tag: candidate[1],
            payload,
        })
    }

    fn axes(&self, scale: &Scale) -> Vector3 {
        let p = &self.payload;
        Vector3::new(
            scale.apply(i16::from_le_bytes([p[0], p[1]])),
            scale.apply(i16::from_le_bytes([p[2], p[3]])),
            scale.apply(i16::from_le_bytes([p[4], p[5]])),
        )
    }

    fn decode(&self) -> Result<Reading, DecodeAnomaly> {
        let kind = ReadingKind::from_tag(self.tag).ok_or(DecodeAnomaly::UnknownType(self.tag))?;
        let v = self.axes(kind.scale());
        Ok(match kind {
            ReadingKind::Acceleration => Reading::Acceleration(v),
            ReadingKind::AngularVelocity => Reading::AngularVelocity(v),
            ReadingKind::Angle => Reading::Angle(v),
            ReadingKind::Magnetometer => Reading::Magnetometer(v),
        })
    }
}

/// Counters of what the decoder has consumed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Frames that passed the checksum, supported or not.
    pub frames: u64,
    pub checksum_errors: u64,
    pub unknown_types: u64,
    /// Bytes dropped while hunting for a start marker.
    pub skipped_bytes: u64,
}

/// Incremental frame decoder.
///
/// Bytes are appended with [`FrameDecoder::feed`]; the returned iterator
/// yields readings lazily and stops as soon as no complete frame is left.
/// Anything not consumed, including frames left behind when the iterator is
/// dropped early, is picked up by the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    head: usize,
    stats: DecodeStats,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and iterate over the readings now available.
    pub fn feed(&mut self, bytes: &[u8]) -> Readings<'_> {
        self.compact();
        self.buf.extend_from_slice(bytes);
        Readings { decoder: self }
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.head
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Drop buffered bytes and counters, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.head = 0;
        self.stats = DecodeStats::default();
    }

    fn compact(&mut self) {
        if self.head > 0 {
            self.buf.drain(..self.head);
            self.head = 0;
        }
    }

    fn next_reading(&mut self) -> Option<Reading> {
        loop {
            let pending = &self.buf[self.head..];
            match pending.iter().position(|&b| b == START_MARKER) {
                Some(offset) => {
                    self.stats.skipped_bytes += offset as u64;
                    self.head += offset;
                }
                None => {
                    self.stats.skipped_bytes += pending.len() as u64;
                    self.head = self.buf.len();
                    return None;
                }
            }

            if self.pending() < FRAME_LEN {
                return None;
            }

            let candidate = &self.buf[self.head..self.head + FRAME_LEN];
            let frame = match RawFrame::parse(candidate) {
                Ok(frame) => frame,
                Err(anomaly) => {
                    trace!("resynchronising: {anomaly}");
                    self.stats.checksum_errors += 1;
                    // Only the marker is discarded; a valid frame may start inside the candidate.
                    self.head += 1;
                    continue;
                }
            };

            self.head += FRAME_LEN;
            self.stats.frames += 1;
            return Some(match frame.decode() {
                Ok(reading) => reading,
                Err(anomaly) => {
                    debug!("{anomaly}");
                    self.stats.unknown_types += 1;
                    Reading::Unsupported(frame.tag)
                }
            });
        }
    }
}

/// Lazy sequence of readings produced by one [`FrameDecoder::feed`] call.
pub struct Readings<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Readings<'_> {
    type Item = Reading;

    fn next(&mut self) -> Option<Reading> {
        self.decoder.next_reading()
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Output rates the module accepts, with their register codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnRate {
    Hz0_2,
    Hz0_5,
    Hz1,
    Hz2,
    Hz5,
    #[default]
    Hz10,
    Hz20,
    Hz50,
    Hz100,
    Hz200,
}

impl ReturnRate {
    pub const ALL: [ReturnRate; 10] = [
        ReturnRate::Hz0_2,
        ReturnRate::Hz0_5,
        ReturnRate::Hz1,
        ReturnRate::Hz2,
        ReturnRate::Hz5,
        ReturnRate::Hz10,
        ReturnRate::Hz20,
        ReturnRate::Hz50,
        ReturnRate::Hz100,
        ReturnRate::Hz200,
    ];

    /// Register value written to `RRATE`.
    pub fn code(self) -> u8 {
        match self {
            ReturnRate::Hz0_2 => 0x01,
            ReturnRate::Hz0_5 => 0x02,
            ReturnRate::Hz1 => 0x03,
            ReturnRate::Hz2 => 0x04,
            ReturnRate::Hz5 => 0x05,
            ReturnRate::Hz10 => 0x06,
            ReturnRate::Hz20 => 0x07,
            ReturnRate::Hz50 => 0x08,
            ReturnRate::Hz100 => 0x09,
            ReturnRate::Hz200 => 0x0B,
        }
    }

    pub fn as_hz(self) -> f64 {
        match self {
            ReturnRate::Hz0_2 => 0.2,
            ReturnRate::Hz0_5 => 0.5,
            ReturnRate::Hz1 => 1.0,
            ReturnRate::Hz2 => 2.0,
            ReturnRate::Hz5 => 5.0,
            ReturnRate::Hz10 => 10.0,
            ReturnRate::Hz20 => 20.0,
            ReturnRate::Hz50 => 50.0,
            ReturnRate::Hz100 => 100.0,
            ReturnRate::Hz200 => 200.0,
        }
    }

    /// Exact match against the supported set.
    pub fn from_hz(hz: f64) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|rate| (rate.as_hz() - hz).abs() < 1e-9)
    }
}

impl fmt::Display for ReturnRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz", self.as_hz())
    }
}

impl FromStr for ReturnRate {
    type Err = String;

    /// Accepts `"10"`, `"10Hz"` or `"0.2hz"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let number = trimmed
            .strip_suffix("Hz")
            .or_else(|| trimmed.strip_suffix("hz"))
            .unwrap_or(trimmed)
            .trim();
        let hz: f64 = number
            .parse()
            .map_err(|_| format!("invalid return rate {s:?}"))?;
        ReturnRate::from_hz(hz).ok_or_else(|| {
            let supported: Vec<String> = Self::ALL.iter().map(|r| r.to_string()).collect();
            format!(
                "unsupported return rate {s:?}. Supported: {}",
                supported.join(", ")
            )
        })
    }
}

/// Configuration command words: `FF AA <register> <lo> <hi>`.
pub mod command {
    use super::ReturnRate;

    pub const LEN: usize = 5;

    const REG_SAVE: u8 = 0x00;
    const REG_CALSW: u8 = 0x01;
    const REG_RRATE: u8 = 0x03;

    const CALSW_NORMAL: u8 = 0x00;
    const CALSW_ACCEL: u8 = 0x01;

    fn write_register(register: u8, value: u8) -> [u8; LEN] {
        [0xFF, 0xAA, register, value, 0x00]
    }

    /// Must precede any register write.
    pub fn unlock() -> [u8; LEN] {
        [0xFF, 0xAA, 0x69, 0x88, 0xB5]
    }

    /// Persist the current configuration.
    pub fn save() -> [u8; LEN] {
        write_register(REG_SAVE, 0x00)
    }

    pub fn return_rate(rate: ReturnRate) -> [u8; LEN] {
        write_register(REG_RRATE, rate.code())
    }

    /// Enter accelerometer calibration; the sensor must lie still and level.
    pub fn begin_accel_calibration() -> [u8; LEN] {
        write_register(REG_CALSW, CALSW_ACCEL)
    }

    pub fn end_calibration() -> [u8; LEN] {
        write_register(REG_CALSW, CALSW_NORMAL)
    }
}
