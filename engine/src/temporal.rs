//! Scalar temporal types used as field values.
//!
//! These follow the AppSync scalar formats:
//!
//! - [`Date`]: `AWSDate`, an extended ISO-8601 date with an optional offset
//!   (`2024-02-29`, `2024-02-29Z`, `2024-02-29+05:30`)
//! - [`Time`]: `AWSTime`, an extended ISO-8601 time with an optional offset
//!   (`13:45`, `13:45:10.250`, `13:45:10-08:00`)
//! - [`DateTime`]: `AWSDateTime`, an ISO-8601 date-time with a mandatory offset
//! - [`Timestamp`]: `AWSTimestamp`, whole seconds since the Unix epoch
//!
//! Equality is structural (the same instant written with two different offsets
//! is two different values), while ordering compares the instant each value
//! denotes. Values without an offset are interpreted as UTC for ordering.

use crate::error::{Error, Result};
use chrono::{
    FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, SecondsFormat, TimeZone, Utc,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

fn utc() -> FixedOffset {
    Utc.fix()
}

/// Split a trailing `Z` / `±HH:MM` / `±HH:MM:SS` offset off `text`.
fn split_offset(text: &str) -> Option<(&str, FixedOffset)> {
    if let Some(rest) = text.strip_suffix('Z').or_else(|| text.strip_suffix('z')) {
        return Some((rest, utc()));
    }
    // Offsets are at least "+HH:MM"; look for the sign after any date part.
    let sign_pos = text.rfind(['+', '-'])?;
    let (body, offset) = text.split_at(sign_pos);
    if body.is_empty() || !offset[1..].contains(':') {
        return None;
    }
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let mut parts = offset[1..].split(':');
    let hours: i32 = parts.next()?.parse().ok()?;
    let minutes: i32 = parts.next()?.parse().ok()?;
    let seconds: i32 = match parts.next() {
        Some(s) => s.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() || hours > 18 || minutes > 59 || seconds > 59 {
        return None;
    }
    let total = sign * (hours * 3600 + minutes * 60 + seconds);
    FixedOffset::east_opt(total).map(|o| (body, o))
}

fn format_offset(offset: &FixedOffset) -> String {
    let total = offset.local_minus_utc();
    if total == 0 {
        return "Z".to_string();
    }
    let sign = if total < 0 { '-' } else { '+' };
    let abs = total.abs();
    let (h, m, s) = (abs / 3600, (abs % 3600) / 60, abs % 60);
    if s == 0 {
        format!("{}{:02}:{:02}", sign, h, m)
    } else {
        format!("{}{:02}:{:02}:{:02}", sign, h, m, s)
    }
}

fn parse_naive_time(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .ok()
}

/// An `AWSDate` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Date {
    date: NaiveDate,
    offset: Option<FixedOffset>,
}

impl Date {
    /// Create a date without an offset.
    pub fn new(date: NaiveDate) -> Self {
        Self { date, offset: None }
    }

    /// Create a date pinned to an offset.
    pub fn with_offset(date: NaiveDate, offset: FixedOffset) -> Self {
        Self {
            date,
            offset: Some(offset),
        }
    }

    /// Parse an `AWSDate` string.
    pub fn parse(text: &str) -> Result<Self> {
        let err = || Error::InvalidTemporal {
            kind: "AWSDate",
            input: text.to_string(),
        };
        if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            return Ok(Self::new(date));
        }
        let (body, offset) = split_offset(text).ok_or_else(err)?;
        let date = NaiveDate::parse_from_str(body, "%Y-%m-%d").map_err(|_| err())?;
        Ok(Self::with_offset(date, offset))
    }

    /// Format back into the `AWSDate` wire form.
    pub fn format(&self) -> String {
        let date = self.date.format("%Y-%m-%d").to_string();
        match &self.offset {
            Some(offset) => format!("{}{}", date, format_offset(offset)),
            None => date,
        }
    }

    pub fn naive(&self) -> NaiveDate {
        self.date
    }

    pub fn offset_seconds(&self) -> Option<i32> {
        self.offset.map(|o| o.local_minus_utc())
    }

    /// Milliseconds since the epoch of midnight at this date.
    pub fn epoch_millis(&self) -> i64 {
        let midnight = self.date.and_time(NaiveTime::default());
        let offset = self.offset.map(|o| o.local_minus_utc()).unwrap_or(0) as i64;
        midnight.and_utc().timestamp_millis() - offset * 1000
    }
}

/// An `AWSTime` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Time {
    time: NaiveTime,
    offset: Option<FixedOffset>,
}

impl Time {
    pub fn new(time: NaiveTime) -> Self {
        Self { time, offset: None }
    }

    pub fn with_offset(time: NaiveTime, offset: FixedOffset) -> Self {
        Self {
            time,
            offset: Some(offset),
        }
    }

    /// Parse an `AWSTime` string.
    pub fn parse(text: &str) -> Result<Self> {
        let err = || Error::InvalidTemporal {
            kind: "AWSTime",
            input: text.to_string(),
        };
        if let Some(time) = parse_naive_time(text) {
            return Ok(Self::new(time));
        }
        let (body, offset) = split_offset(text).ok_or_else(err)?;
        let time = parse_naive_time(body).ok_or_else(err)?;
        Ok(Self::with_offset(time, offset))
    }

    /// Format back into the `AWSTime` wire form. Seconds are always written,
    /// fractional seconds only when present.
    pub fn format(&self) -> String {
        let time = self.time.format("%H:%M:%S%.f").to_string();
        match &self.offset {
            Some(offset) => format!("{}{}", time, format_offset(offset)),
            None => time,
        }
    }

    pub fn naive(&self) -> NaiveTime {
        self.time
    }

    pub fn offset_seconds(&self) -> Option<i32> {
        self.offset.map(|o| o.local_minus_utc())
    }

    /// Milliseconds since the epoch of this time on 1970-01-01.
    pub fn epoch_millis(&self) -> i64 {
        let on_epoch_day = NaiveDateTime::new(NaiveDate::default(), self.time);
        let offset = self.offset.map(|o| o.local_minus_utc()).unwrap_or(0) as i64;
        on_epoch_day.and_utc().timestamp_millis() - offset * 1000
    }
}

/// An `AWSDateTime` value.
#[derive(Debug, Clone, Copy)]
pub struct DateTime {
    inner: chrono::DateTime<FixedOffset>,
}

// chrono compares instants only; the offset is part of the value here.
impl PartialEq for DateTime {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner && self.offset_seconds() == other.offset_seconds()
    }
}

impl Eq for DateTime {}

impl std::hash::Hash for DateTime {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
        self.offset_seconds().hash(state);
    }
}

impl DateTime {
    pub fn new(inner: chrono::DateTime<FixedOffset>) -> Self {
        Self { inner }
    }

    /// Build from milliseconds since the epoch, expressed at `offset_seconds`.
    pub fn from_epoch_millis(millis: i64, offset_seconds: i32) -> Result<Self> {
        let err = || Error::InvalidTemporal {
            kind: "AWSDateTime",
            input: format!("{}ms@{}s", millis, offset_seconds),
        };
        let offset = FixedOffset::east_opt(offset_seconds).ok_or_else(err)?;
        let utc = chrono::DateTime::from_timestamp_millis(millis).ok_or_else(err)?;
        Ok(Self {
            inner: utc.with_timezone(&offset),
        })
    }

    /// Parse an `AWSDateTime` string. The offset is mandatory; seconds are not.
    pub fn parse(text: &str) -> Result<Self> {
        if let Ok(inner) = chrono::DateTime::parse_from_rfc3339(text) {
            return Ok(Self { inner });
        }
        let err = || Error::InvalidTemporal {
            kind: "AWSDateTime",
            input: text.to_string(),
        };
        let (body, offset) = split_offset(text).ok_or_else(err)?;
        let naive = NaiveDateTime::parse_from_str(body, "%Y-%m-%dT%H:%M").map_err(|_| err())?;
        let inner = offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(err)?;
        Ok(Self { inner })
    }

    pub fn format(&self) -> String {
        self.inner.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub fn offset_seconds(&self) -> i32 {
        self.inner.offset().local_minus_utc()
    }

    pub fn epoch_millis(&self) -> i64 {
        self.inner.timestamp_millis()
    }

    pub fn inner(&self) -> &chrono::DateTime<FixedOffset> {
        &self.inner
    }
}

/// An `AWSTimestamp` value: whole seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_seconds(seconds: i64) -> Self {
        Self(seconds)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(millis.div_euclid(1000))
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn seconds(&self) -> i64 {
        self.0
    }
}

macro_rules! temporal_impls {
    ($ty:ident) => {
        impl Ord for $ty {
            fn cmp(&self, other: &Self) -> Ordering {
                // Instant first; the wire form breaks ties so Ord agrees with Eq.
                self.epoch_millis()
                    .cmp(&other.epoch_millis())
                    .then_with(|| self.format().cmp(&other.format()))
            }
        }

        impl $ty {
            /// Text whose byte order is this type's [`Ord`]: the instant as
            /// fixed-width offset-binary millis, then the wire form.
            pub fn sort_key(&self) -> String {
                let biased = (self.epoch_millis() as u64) ^ (1 << 63);
                format!("{:020}{}", biased, self.format())
            }
        }

        impl PartialOrd for $ty {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.format())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.format())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                Self::parse(&text).map_err(serde::de::Error::custom)
            }
        }
    };
}

temporal_impls!(Date);
temporal_impls!(Time);
temporal_impls!(DateTime);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
