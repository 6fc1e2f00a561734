//! GPS / timing block attached to frames by cameras with a GPS module.
//!
//! The block is at least 44 bytes of big-endian fields at fixed offsets:
//!
//! ```text
//! offset  len  field
//!  0      4    sequence number
//!  5      2    width
//!  7      2    height
//!  9      4    latitude  (packed, > 1e9 means south)
//! 13      4    longitude (packed, > 1e9 means west)
//! 18      4    exposure start, seconds since epoch
//! 22      3    exposure start, tenths of microseconds
//! 26      4    exposure end, seconds
//! 30      3    exposure end, tenths of microseconds
//! 33      1    status (bits 4-5)
//! 34      4    current time, seconds
//! 38      3    current time, tenths of microseconds
//! 41      3    PPS counter
//! ```
//!
//! Timestamps count from 1995-10-10T00:00:00 UTC.

use crate::error::{CaptureError, CaptureResult};
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use chrono_tz::Tz;
use std::fmt;

/// Zone used to localize telemetry timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalZone {
    /// Same offset all year.
    Fixed(FixedOffset),
    /// IANA zone; the offset follows its daylight saving rules.
    Named(Tz),
}

impl LocalZone {
    /// Express `utc` in this zone, resolving the offset in effect at that instant.
    pub fn localize(self, utc: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self {
            LocalZone::Fixed(offset) => utc.with_timezone(&offset),
            LocalZone::Named(tz) => utc.with_timezone(&tz).fixed_offset(),
        }
    }
}

impl From<FixedOffset> for LocalZone {
    fn from(offset: FixedOffset) -> Self {
        LocalZone::Fixed(offset)
    }
}

impl From<Tz> for LocalZone {
    fn from(tz: Tz) -> Self {
        LocalZone::Named(tz)
    }
}

/// Minimum block length.
pub const TELEMETRY_LEN: usize = 44;

const EPOCH: (i32, u32, u32) = (1995, 10, 10);
const HEMISPHERE_FLAG: u64 = 1_000_000_000;

/// One decoded telemetry block.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    /// Frame sequence number
    pub sequence_number: u32,
    /// Image width reported by the camera
    pub width: u16,
    /// Image height reported by the camera
    pub height: u16,
    /// Decimal degrees, negative south
    pub latitude: f64,
    /// Decimal degrees, negative west
    pub longitude: f64,
    /// Exposure start
    pub start_time: DateTime<FixedOffset>,
    /// Exposure end
    pub end_time: DateTime<FixedOffset>,
    /// Time the block was written
    pub current_time: DateTime<FixedOffset>,
    /// End minus start, microseconds
    pub exposure_micros: i64,
    /// PPS pulses counted
    pub pps_count: u32,
    /// GPS lock status, 0..=3
    pub status_flag: u8,
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const TS: &str = "%Y-%m-%d %H:%M:%S";
        writeln!(f, "status_flag     : {}", self.status_flag)?;
        writeln!(f, "pps             : {}", self.pps_count)?;
        writeln!(f, "sequence_number : {}", self.sequence_number)?;
        writeln!(f, "width           : {}", self.width)?;
        writeln!(f, "height          : {}", self.height)?;
        writeln!(f, "latitude        : {:.6}", self.latitude)?;
        writeln!(f, "longitude       : {:.6}", self.longitude)?;
        writeln!(f, "start_time      : {}", self.start_time.format(TS))?;
        writeln!(f, "end_time        : {}", self.end_time.format(TS))?;
        writeln!(f, "current_time    : {}", self.current_time.format(TS))?;
        write!(f, "exposure_us     : {}", self.exposure_micros)
    }
}

/// Decode a telemetry block, localizing timestamps to `zone`.
pub fn decode(block: &[u8], zone: impl Into<LocalZone>) -> CaptureResult<TelemetryRecord> {
    let zone = zone.into();
    if block.len() < TELEMETRY_LEN {
        return Err(CaptureError::TelemetryParse {
            len: block.len(),
            required: TELEMETRY_LEN,
        });
    }

    let field = |at: usize, len: usize| -> u64 { (&block[at..at + len]).get_uint(len) };

    let sequence_number = field(0, 4) as u32;
    let width = field(5, 2) as u16;
    let height = field(7, 2) as u16;

    let latitude = packed_degrees(field(9, 4), 10_000_000, 100_000);
    let longitude = packed_degrees(field(13, 4), 1_000_000, 10_000);

    let start_sec = field(18, 4) as u32;
    let start_us = (field(22, 3) / 10) as u32;
    let end_sec = field(26, 4) as u32;
    let end_us = (field(30, 3) / 10) as u32;
    let status_flag = (block[33] / 16) % 4;
    let now_sec = field(34, 4) as u32;
    let now_us = (field(38, 3) / 10) as u32;
    let pps_count = field(41, 3) as u32;

    let exposure_micros = (i64::from(end_sec) - i64::from(start_sec)) * 1_000_000
        + (i64::from(end_us) - i64::from(start_us));

    Ok(TelemetryRecord {
        sequence_number,
        width,
        height,
        latitude,
        longitude,
        start_time: seconds_to_local_time(start_sec, start_us, zone)?,
        end_time: seconds_to_local_time(end_sec, end_us, zone)?,
        current_time: seconds_to_local_time(now_sec, now_us, zone)?,
        exposure_micros,
        pps_count,
        status_flag,
    })
}

/// `deg * deg_scale + min * min_scale + frac`, with the hemisphere flag above 1e9.
fn packed_degrees(raw: u64, deg_scale: u64, min_scale: u64) -> f64 {
    let negative = raw > HEMISPHERE_FLAG;
    let value = raw % HEMISPHERE_FLAG;
    let degrees = (value / deg_scale) as f64;
    let minutes = ((value % deg_scale) / min_scale) as f64;
    let fraction = (value % min_scale) as f64 / min_scale as f64;
    let magnitude = degrees + (minutes + fraction) / 60.0;
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// Gregorian leap year.
pub fn is_leap_year(year: i32) -> bool {
    year % 400 == 0 || (year % 4 == 0 && year % 100 != 0)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        2 if is_leap_year(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

fn days_in_year(year: i32) -> u64 {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

/// Calendar date `days` after the telemetry epoch.
fn civil_date(days: u64) -> (i32, u32, u32) {
    let (mut year, mut month, mut day) = EPOCH;
    let mut remaining = days;

    while remaining > 0 {
        if month == 1 && day == 1 && remaining >= days_in_year(year) {
            remaining -= days_in_year(year);
            year += 1;
            continue;
        }
        let left_in_month = u64::from(days_in_month(year, month) - day);
        if remaining <= left_in_month {
            day += remaining as u32;
            remaining = 0;
        } else {
            remaining -= left_in_month + 1;
            day = 1;
            month += 1;
            if month > 12 {
                month = 1;
                year += 1;
            }
        }
    }
    (year, month, day)
}

/// Convert epoch seconds plus microseconds to local time.
pub fn seconds_to_local_time(
    seconds: u32,
    micros: u32,
    zone: impl Into<LocalZone>,
) -> CaptureResult<DateTime<FixedOffset>> {
    let total_micros = u64::from(seconds) * 1_000_000 + u64::from(micros);
    let whole_seconds = total_micros / 1_000_000;
    let sub_micros = (total_micros % 1_000_000) as u32;

    let (year, month, day) = civil_date(whole_seconds / 86_400);
    let secs_of_day = (whole_seconds % 86_400) as u32;

    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| {
            d.and_hms_micro_opt(
                secs_of_day / 3600,
                (secs_of_day / 60) % 60,
                secs_of_day % 60,
                sub_micros,
            )
        })
        .ok_or_else(|| {
            CaptureError::Protocol(format!("telemetry time {seconds}s is not representable"))
        })?;

    Ok(zone
        .into()
        .localize(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)))
}

/// Raw field values of a telemetry block, as a camera would write them.
///
/// Time pairs are `(seconds since epoch, tenths of microseconds)`; positions use the packed
/// encoding [`decode`] expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryBlock {
    pub sequence_number: u32,
    pub width: u16,
    pub height: u16,
    pub latitude: u32,
    pub longitude: u32,
    pub start: (u32, u32),
    pub end: (u32, u32),
    /// GPS lock status, 0..=3
    pub status: u8,
    pub now: (u32, u32),
    pub pps_count: u32,
}

impl TelemetryBlock {
    /// Encode into the 44-byte wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let tenths = |v: u32| u64::from(v & 0x00FF_FFFF);
        let mut buf = BytesMut::with_capacity(TELEMETRY_LEN);
        buf.put_u32(self.sequence_number);
        buf.put_u8(0);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u32(self.latitude);
        buf.put_u32(self.longitude);
        buf.put_u8(0);
        buf.put_u32(self.start.0);
        buf.put_uint(tenths(self.start.1), 3);
        buf.put_u8(0);
        buf.put_u32(self.end.0);
        buf.put_uint(tenths(self.end.1), 3);
        buf.put_u8((self.status & 0x03) << 4);
        buf.put_u32(self.now.0);
        buf.put_uint(tenths(self.now.1), 3);
        buf.put_uint(u64::from(self.pps_count & 0x00FF_FFFF), 3);
        buf.to_vec()
    }
}
