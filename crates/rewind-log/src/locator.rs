//! Textual names for frames.
//!
//! | form                         | meaning                                  |
//! |------------------------------|------------------------------------------|
//! | `50`, `#50`, `i:50`          | absolute frame position                  |
//! | `1714564800000`, `@1000`     | epoch milliseconds, rounded down         |
//! | `1000#1`                     | exact timestamp and ordinal              |
//! | `+250`, `+250ms`, `+3s`      | offset from the first frame of the run   |
//! | `2024-05-01T12:00:00Z`       | wall clock (naive forms are taken as UTC)|
//!
//! A bare number below [`INDEX_TIMESTAMP_THRESHOLD`] is a position, anything
//! at or above it is epoch milliseconds.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::error::LogError;
use crate::event::Timestamp;

/// 10^11 ms is early March 1973; no recording predates it and no run
/// reaches that many frames.
pub const INDEX_TIMESTAMP_THRESHOLD: u64 = 100_000_000_000;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator {
    Index(u64),
    Frame { ts: Timestamp, k: u32 },
    Timestamp(Timestamp),
    /// Milliseconds after the first frame.
    Offset(i64),
    WallClock(DateTime<Utc>),
}

impl FromStr for Locator {
    type Err = LogError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim();
        if s.is_empty() {
            return Err(LogError::invalid_locator(input, "empty locator"));
        }

        if let Some(rest) = s.strip_prefix('#').or_else(|| s.strip_prefix("i:")) {
            return parse_number(input, rest).map(Locator::Index);
        }
        if let Some(rest) = s.strip_prefix('@') {
            return parse_number(input, rest).map(Locator::Timestamp);
        }
        if let Some(rest) = s.strip_prefix('+') {
            return parse_offset(input, rest).map(Locator::Offset);
        }
        if let Some((ts, k)) = s.split_once('#') {
            let ts = parse_number(input, ts)?;
            let k = parse_number(input, k)?;
            return Ok(Locator::Frame { ts, k });
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            let n: u64 = parse_number(input, s)?;
            if n < INDEX_TIMESTAMP_THRESHOLD {
                return Ok(Locator::Index(n));
            }
            let ts = Timestamp::try_from(n)
                .map_err(|_| LogError::invalid_locator(input, "timestamp out of range"))?;
            return Ok(Locator::Timestamp(ts));
        }
        parse_wall_clock(s)
            .map(Locator::WallClock)
            .ok_or_else(|| LogError::invalid_locator(input, "not an index, timestamp, offset or date"))
    }
}

fn parse_number<T: FromStr>(input: &str, digits: &str) -> Result<T, LogError> {
    let digits = digits.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(LogError::invalid_locator(
            input,
            format!("'{}' is not a non-negative integer", digits),
        ));
    }
    digits
        .parse()
        .map_err(|_| LogError::invalid_locator(input, format!("'{}' is out of range", digits)))
}

fn parse_offset(input: &str, rest: &str) -> Result<i64, LogError> {
    let rest = rest.trim();
    if let Some(ms) = rest.strip_suffix("ms") {
        return parse_number(input, ms);
    }
    if let Some(secs) = rest.strip_suffix('s') {
        let secs: i64 = parse_number(input, secs)?;
        return secs
            .checked_mul(1000)
            .ok_or_else(|| LogError::invalid_locator(input, "offset out of range"));
    }
    parse_number(input, rest)
}

fn parse_wall_clock(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Index(i) => write!(f, "#{}", i),
            Locator::Frame { ts, k } => write!(f, "{}#{}", ts, k),
            Locator::Timestamp(ts) => write!(f, "@{}", ts),
            Locator::Offset(ms) => write!(f, "+{}ms", ms),
            Locator::WallClock(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Locator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LocatorVisitor;

        impl de::Visitor<'_> for LocatorVisitor {
            type Value = Locator;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a frame locator string or a non-negative integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Locator, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Locator, E> {
                v.to_string().parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Locator, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom("locator must not be negative"))
                    .and_then(|v| self.visit_u64(v))
            }
        }

        deserializer.deserialize_any(LocatorVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(s: &str) -> Locator {
        s.parse().unwrap()
    }

    #[test]
    fn test_bare_numbers_split_on_threshold() {
        assert_eq!(parse("50"), Locator::Index(50));
        assert_eq!(parse("99999999999"), Locator::Index(99_999_999_999));
        assert_eq!(
            parse("1714564800000"),
            Locator::Timestamp(1_714_564_800_000)
        );
    }

    #[test]
    fn test_prefixes_force_interpretation() {
        assert_eq!(parse("#1714564800000"), Locator::Index(1_714_564_800_000));
        assert_eq!(parse("i:7"), Locator::Index(7));
        assert_eq!(parse("@1200"), Locator::Timestamp(1200));
    }

    #[test]
    fn test_frame_and_offset_forms() {
        assert_eq!(parse("1000#1"), Locator::Frame { ts: 1000, k: 1 });
        assert_eq!(parse("+250"), Locator::Offset(250));
        assert_eq!(parse("+250ms"), Locator::Offset(250));
        assert_eq!(parse("+3s"), Locator::Offset(3000));
    }

    #[test]
    fn test_wall_clock_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(parse("2024-05-01T12:00:00Z"), Locator::WallClock(expected));
        assert_eq!(parse("2024-05-01T14:00:00+02:00"), Locator::WallClock(expected));
        assert_eq!(parse("2024-05-01 12:00:00"), Locator::WallClock(expected));
        assert_eq!(parse("2024-05-01T12:00:00.000"), Locator::WallClock(expected));
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "  ", "abc", "#", "#-1", "1000#", "#1#2", "+", "+xs", "-5", "12ab"] {
            let err = bad.parse::<Locator>().unwrap_err();
            assert!(
                matches!(err, LogError::InvalidLocator { .. }),
                "{:?} gave {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_display_round_trips() {
        for loc in [
            Locator::Index(3),
            Locator::Frame { ts: 1000, k: 2 },
            Locator::Timestamp(1200),
            Locator::Offset(500),
            Locator::WallClock(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
        ] {
            assert_eq!(loc.to_string().parse::<Locator>().unwrap(), loc);
        }
    }

    #[test]
    fn test_serde_accepts_strings_and_integers() {
        let from_str: Locator = serde_json::from_str("\"1000#1\"").unwrap();
        assert_eq!(from_str, Locator::Frame { ts: 1000, k: 1 });
        let from_int: Locator = serde_json::from_str("12").unwrap();
        assert_eq!(from_int, Locator::Index(12));
        assert!(serde_json::from_str::<Locator>("-1").is_err());
        assert_eq!(
            serde_json::to_string(&Locator::Timestamp(5)).unwrap(),
            "\"@5\""
        );
    }
}
