//! Bucket boundary computation.
//!
//! Buckets follow calendar fields in a configured zone rather than fixed-size
//! epoch windows, so a `month` bucket starts on the first of the month and a
//! `day` bucket at local midnight.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, FixedOffset, Local, NaiveDateTime, Offset, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};

use super::error::RollupError;

/// Width of a rollup bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Minute,
    Hour,
    Day,
    Month,
}

impl Resolution {
    /// All resolutions, finest first.
    pub const ALL: [Resolution; 4] = [Self::Minute, Self::Hour, Self::Day, Self::Month];

    /// Returns the canonical label used in configuration and storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// Convert from the canonical label.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "month" => Some(Self::Month),
            _ => None,
        }
    }

    /// Zeroes every calendar field finer than this resolution.
    fn floor_naive(self, t: NaiveDateTime) -> NaiveDateTime {
        let date = t.date();
        let (date, hour, minute) = match self {
            Self::Minute => (date, t.hour(), t.minute()),
            Self::Hour => (date, t.hour(), 0),
            Self::Day => (date, 0, 0),
            Self::Month => (date.with_day(1).unwrap_or(date), 0, 0),
        };
        date.and_hms_opt(hour, minute, 0).unwrap_or(t)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| RollupError::UnknownResolution {
            label: s.to_string(),
        })
    }
}

/// Zone whose calendar fields drive truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarZone {
    Utc,
    /// The host's local zone, DST included.
    Local,
    Fixed(FixedOffset),
}

impl Default for CalendarZone {
    fn default() -> Self {
        Self::Local
    }
}

impl CalendarZone {
    /// Parses `utc`, `local`, or an offset of the form `+HH:MM` / `-HH:MM`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "utc" | "z" => Some(Self::Utc),
            "local" => Some(Self::Local),
            other => parse_offset(other).map(Self::Fixed),
        }
    }

    /// Truncates `ts` to the start of its `resolution` bucket.
    pub fn truncate(&self, ts: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
        match self {
            Self::Utc => truncate_in(&Utc, ts, resolution),
            Self::Local => truncate_in(&Local, ts, resolution),
            Self::Fixed(offset) => truncate_in(offset, ts, resolution),
        }
    }
}

fn truncate_in<Tz: TimeZone>(tz: &Tz, ts: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
    let local = ts.with_timezone(tz);
    let floored = resolution.floor_naive(local.naive_local());

    if let Some(start) = tz.from_local_datetime(&floored).earliest() {
        return start.with_timezone(&Utc);
    }

    // The boundary falls in a DST gap; reuse the event's own offset.
    let offset = local.offset().fix();
    offset
        .from_local_datetime(&floored)
        .single()
        .map(|start| start.with_timezone(&Utc))
        .unwrap_or(ts)
}

fn parse_offset(value: &str) -> Option<FixedOffset> {
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn test_truncate_each_resolution_utc() {
        let ts = utc("2024-03-17T09:47:31.250Z");
        let zone = CalendarZone::Utc;

        assert_eq!(
            zone.truncate(ts, Resolution::Minute),
            utc("2024-03-17T09:47:00Z")
        );
        assert_eq!(
            zone.truncate(ts, Resolution::Hour),
            utc("2024-03-17T09:00:00Z")
        );
        assert_eq!(
            zone.truncate(ts, Resolution::Day),
            utc("2024-03-17T00:00:00Z")
        );
        assert_eq!(
            zone.truncate(ts, Resolution::Month),
            utc("2024-03-01T00:00:00Z")
        );
    }

    #[test]
    fn test_truncate_is_idempotent() {
        let zones = [
            CalendarZone::Utc,
            CalendarZone::Local,
            CalendarZone::parse("+05:30").expect("valid offset"),
        ];
        let ts = utc("2023-12-31T23:59:59.999Z");

        for zone in zones {
            for resolution in Resolution::ALL {
                let once = zone.truncate(ts, resolution);
                assert_eq!(zone.truncate(once, resolution), once, "{zone:?} {resolution}");
            }
        }
    }

    #[test]
    fn test_truncate_respects_fixed_offset_calendar() {
        // 2024-02-29T20:30Z is 2024-03-01T02:00 at +05:30.
        let zone = CalendarZone::parse("+05:30").expect("valid offset");
        let ts = utc("2024-02-29T20:30:00Z");

        assert_eq!(
            zone.truncate(ts, Resolution::Month),
            utc("2024-02-29T18:30:00Z")
        );
        assert_eq!(
            zone.truncate(ts, Resolution::Day),
            utc("2024-02-29T18:30:00Z")
        );
        // Half-hour offset: the local hour starts at :30 UTC.
        assert_eq!(
            zone.truncate(ts, Resolution::Hour),
            utc("2024-02-29T20:30:00Z")
        );
    }

    #[test]
    fn test_month_boundaries_are_calendar_not_fixed_width() {
        let zone = CalendarZone::Utc;
        let feb = zone.truncate(utc("2023-02-28T12:00:00Z"), Resolution::Month);
        let mar = zone.truncate(utc("2023-03-01T00:00:00Z"), Resolution::Month);
        assert_eq!(feb, utc("2023-02-01T00:00:00Z"));
        assert_eq!(mar, utc("2023-03-01T00:00:00Z"));
        assert_ne!(feb, mar);
    }

    #[test]
    fn test_resolution_labels_round_trip() {
        for resolution in Resolution::ALL {
            assert_eq!(Resolution::from_name(resolution.as_str()), Some(resolution));
        }
        assert_eq!(Resolution::from_name("week"), None);
        let err = "week".parse::<Resolution>().unwrap_err();
        assert_eq!(
            err,
            RollupError::UnknownResolution {
                label: "week".to_string()
            }
        );
    }

    #[test]
    fn test_calendar_zone_parse() {
        assert_eq!(CalendarZone::parse("UTC"), Some(CalendarZone::Utc));
        assert_eq!(CalendarZone::parse("local"), Some(CalendarZone::Local));
        assert_eq!(
            CalendarZone::parse("-08:00"),
            FixedOffset::west_opt(8 * 3600).map(CalendarZone::Fixed)
        );
        assert_eq!(CalendarZone::parse("+24:00"), None);
        assert_eq!(CalendarZone::parse("europe"), None);
    }
}
