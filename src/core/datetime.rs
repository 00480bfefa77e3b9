/// Date and time normalization.
///
/// Backends hand back temporal columns either as epoch integers or as text in
/// one of the usual SQL layouts. Everything is normalized to a UTC
/// [`DateTime`] breakdown or to epoch seconds.
use crate::core::types::DateTime;
use crate::core::{DbError, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

const DATETIME_OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d"];
const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

/// Breaks epoch seconds down into a UTC calendar value.
pub fn from_epoch(secs: i64) -> Result<DateTime> {
    let instant = chrono::DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| DbError::Conversion(format!("timestamp {} is out of range", secs)))?;
    Ok(from_naive(&instant.naive_utc()))
}

/// Parses a textual DATE, TIME, DATETIME or TIMESTAMP value.
///
/// Values carrying an explicit UTC offset are shifted to UTC. A string made
/// only of digits, optionally signed, is read as epoch seconds.
pub fn parse(text: &str) -> Result<DateTime> {
    let text = text.trim();

    if let Ok(instant) = chrono::DateTime::parse_from_rfc3339(text) {
        return Ok(from_naive(&instant.naive_utc()));
    }
    for format in DATETIME_OFFSET_FORMATS {
        if let Ok(instant) = chrono::DateTime::parse_from_str(text, format) {
            return Ok(from_naive(&instant.naive_utc()));
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(from_naive(&dt));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Ok(DateTime {
                year: date.year(),
                month: date.month(),
                day: date.day(),
                ..Default::default()
            });
        }
    }
    for format in TIME_FORMATS {
        if let Ok(time) = NaiveTime::parse_from_str(text, format) {
            return Ok(DateTime {
                hour: time.hour(),
                minute: time.minute(),
                second: time.second(),
                ..Default::default()
            });
        }
    }
    let digits = text.strip_prefix('-').unwrap_or(text);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        let secs = text
            .parse::<i64>()
            .map_err(|e| DbError::Conversion(format!("'{}': {}", text, e)))?;
        return from_epoch(secs);
    }

    Err(DbError::Conversion(format!("'{}' is not a recognized date or time", text)))
}

/// Epoch seconds of a UTC breakdown. TIME-only values count from 1970-01-01.
pub fn to_epoch(value: &DateTime) -> Result<i64> {
    let date = if value.is_time_only() {
        NaiveDate::from_ymd_opt(1970, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(value.year, value.month, value.day)
    }
    .ok_or_else(|| DbError::Conversion(format!("invalid calendar date {:?}", value)))?;
    let dt = date
        .and_hms_opt(value.hour, value.minute, value.second)
        .ok_or_else(|| DbError::Conversion(format!("invalid time of day {:?}", value)))?;
    Ok(dt.and_utc().timestamp() - value.utc_offset as i64)
}

/// Parses text straight to epoch seconds.
pub fn parse_timestamp(text: &str) -> Result<i64> {
    to_epoch(&parse(text)?)
}

fn from_naive(dt: &NaiveDateTime) -> DateTime {
    DateTime {
        year: dt.year(),
        month: dt.month(),
        day: dt.day(),
        hour: dt.hour(),
        minute: dt.minute(),
        second: dt.second(),
        utc_offset: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date() {
        let date = parse("2013-12-28").unwrap();
        assert_eq!((date.year, date.month_index(), date.day), (2013, 11, 28));
        assert_eq!((date.hour, date.minute, date.second), (0, 0, 0));
        assert_eq!(date.utc_offset, 0);
    }

    #[test]
    fn test_parse_time() {
        let time = parse("10:12:42").unwrap();
        assert_eq!(time.year, 0);
        assert_eq!((time.hour, time.minute, time.second), (10, 12, 42));
        assert!(time.is_time_only());
    }

    #[test]
    fn test_parse_datetime_variants() {
        let expected = DateTime { year: 2013, month: 12, day: 28, hour: 10, minute: 12, second: 42, utc_offset: 0 };
        assert_eq!(parse("2013-12-28 10:12:42").unwrap(), expected);
        assert_eq!(parse("2013-12-28T10:12:42").unwrap(), expected);
        assert_eq!(parse("2013-12-28 10:12:42.250").unwrap(), expected);
        assert_eq!(parse("2013-12-28T10:12:42Z").unwrap(), expected);
        assert_eq!(parse("2013-12-28 12:12:42+02").unwrap(), expected);
        assert_eq!(parse("2013-12-28 12:12:42+02:00").unwrap(), expected);
    }

    #[test]
    fn test_epoch_round_trip() {
        let dt = from_epoch(1387066378).unwrap();
        assert_eq!((dt.year, dt.month_index(), dt.day), (2013, 11, 15));
        assert_eq!((dt.hour, dt.minute, dt.second), (0, 12, 58));
        assert_eq!(to_epoch(&dt).unwrap(), 1387066378);
        assert_eq!(parse("1387066378").unwrap(), dt);
        assert_eq!(parse_timestamp("2013-12-15 00:12:58").unwrap(), 1387066378);
    }

    #[test]
    fn test_negative_epoch_text() {
        let dt = parse("-1").unwrap();
        assert_eq!((dt.year, dt.month, dt.day), (1969, 12, 31));
        assert_eq!((dt.hour, dt.minute, dt.second), (23, 59, 59));
        assert_eq!(parse_timestamp("-1").unwrap(), -1);
        assert!(parse("-").is_err());
    }

    #[test]
    fn test_time_only_epoch() {
        assert_eq!(parse_timestamp("10:12:42").unwrap(), 10 * 3600 + 12 * 60 + 42);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("yesterday").is_err());
        assert!(parse("").is_err());
        assert!(parse("2013-13-40").is_err());
    }
}
