//! Host-side value model for column and parameter data
//!
//! [`DbValue`] is what the backend seam produces and consumes; the wire
//! codecs in [`crate::wire`] translate between it and the protobuf
//! representation. Temporal values keep their wire precision (nanoseconds)
//! and their original timezone string, so round-trips are exact even where
//! a host time type would truncate.

use crate::error::ServerError;
use chrono_tz::Tz;

/// An instant paired with the timezone it was expressed in.
///
/// The timezone is `"UTC"`, a numeric offset `±HH:MM`, or an IANA zone id.
/// The instant itself is (epoch seconds, nanos); the zone is carried
/// verbatim so decode(encode(v)) preserves the zone id string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZonedTimestamp {
    pub epoch_seconds: i64,
    pub nanos: u32,
    pub timezone: String,
}

impl ZonedTimestamp {
    pub fn new(
        epoch_seconds: i64,
        nanos: u32,
        timezone: impl Into<String>,
    ) -> Result<Self, ServerError> {
        let timezone = timezone.into();
        validate_timezone(&timezone)?;
        if nanos >= 1_000_000_000 {
            return Err(ServerError::InvalidArgument(format!(
                "timestamp nanos out of range: {}",
                nanos
            )));
        }
        Ok(Self {
            epoch_seconds,
            nanos,
            timezone,
        })
    }
}

/// A calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl CalendarDate {
    pub fn new(year: i32, month: u32, day: u32) -> Result<Self, ServerError> {
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(ServerError::InvalidArgument(format!(
                "invalid calendar date {:04}-{:02}-{:02}",
                year, month, day
            )));
        }
        Ok(Self { year, month, day })
    }
}

/// A wall-clock time of day with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallTime {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub nanos: u32,
}

impl WallTime {
    pub fn new(hour: u32, minute: u32, second: u32, nanos: u32) -> Result<Self, ServerError> {
        if hour >= 24 || minute >= 60 || second >= 60 || nanos >= 1_000_000_000 {
            return Err(ServerError::InvalidArgument(format!(
                "invalid time of day {:02}:{:02}:{:02}.{:09}",
                hour, minute, second, nanos
            )));
        }
        Ok(Self {
            hour,
            minute,
            second,
            nanos,
        })
    }
}

/// A single column or parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    /// SQL NULL; encoded as an absent wire value
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(ZonedTimestamp),
    Date(CalendarDate),
    Time(WallTime),
    Uuid(uuid::Uuid),
    Url(url::Url),
    /// Opaque driver row id; empty bytes is a real value, distinct from Null
    RowId(Vec<u8>),
    Map(Vec<(String, DbValue)>),
    List(Vec<DbValue>),
    Properties(Vec<(String, String)>),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }
}

/// Validate a timezone string: `"UTC"`, a numeric offset `±HH:MM`, or an
/// IANA zone id. Empty and unrecognized strings are invalid.
pub fn validate_timezone(zone: &str) -> Result<(), ServerError> {
    if zone.is_empty() {
        return Err(ServerError::InvalidArgument(
            "timestamp timezone is empty".to_string(),
        ));
    }
    if zone == "UTC" {
        return Ok(());
    }
    if let Some(rest) = zone.strip_prefix('+').or_else(|| zone.strip_prefix('-')) {
        return match rest.split_once(':') {
            Some((hh, mm)) if hh.len() == 2 && mm.len() == 2 => {
                let hours: u32 = hh.parse().map_err(|_| bad_zone(zone))?;
                let minutes: u32 = mm.parse().map_err(|_| bad_zone(zone))?;
                if hours < 24 && minutes < 60 {
                    Ok(())
                } else {
                    Err(bad_zone(zone))
                }
            }
            _ => Err(bad_zone(zone)),
        };
    }
    zone.parse::<Tz>().map(|_| ()).map_err(|_| bad_zone(zone))
}

fn bad_zone(zone: &str) -> ServerError {
    ServerError::InvalidArgument(format!("unrecognized timezone '{}'", zone))
}
