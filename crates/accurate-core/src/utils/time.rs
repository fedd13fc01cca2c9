//! Duration and timestamp helpers
//!
//! Durations travel as integer nanoseconds on the wire. Text input accepts
//! plain seconds (`"60"`, `"1.5"`) or unit suffixed forms (`"1m30s"`, `"250ms"`).

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

use crate::error::AppError;
use crate::AppResult;

/// Nanoseconds in a duration, saturating on overflow
pub fn nanos(d: Duration) -> i64 {
    d.num_nanoseconds().unwrap_or(i64::MAX)
}

pub fn secs_f64(d: Duration) -> f64 {
    nanos(d) as f64 / 1e9
}

/// Parses `"60"`, `"60.5"`, `"60s"`, `"1m30s"`, `"1h"`, `"250ms"`, `"10us"`, `"5ns"`
pub fn parse_duration(s: &str) -> AppResult<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Duration::zero());
    }
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(Duration::seconds(secs));
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Ok(Duration::nanoseconds((secs * 1e9).round() as i64));
    }

    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let mut total: f64 = 0.0;
    let mut rest = body;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| AppError::ParserError(format!("missing unit in duration {}", s)))?;
        if num_end == 0 {
            return Err(AppError::ParserError(format!("invalid duration {}", s)));
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| AppError::ParserError(format!("invalid duration {}", s)))?;
        let after = &rest[num_end..];
        let unit_end = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let factor = match &after[..unit_end] {
            "h" => 3600e9,
            "m" => 60e9,
            "s" => 1e9,
            "ms" => 1e6,
            "us" | "µs" => 1e3,
            "ns" => 1.0,
            other => {
                return Err(AppError::ParserError(format!(
                    "unknown unit {} in duration {}",
                    other, s
                )))
            }
        };
        total += value * factor;
        rest = &after[unit_end..];
    }
    let total = total.round() as i64;
    Ok(Duration::nanoseconds(if negative { -total } else { total }))
}

/// Parses RFC3339, `YYYY-MM-DD HH:MM:SS`, unix epoch seconds, `*now` and empty (epoch zero)
pub fn parse_time(s: &str) -> AppResult<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() || s == "0" {
        return Ok(DateTime::<Utc>::UNIX_EPOCH);
    }
    if s == "*now" {
        return Ok(Utc::now());
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Ok(epoch) = s.parse::<i64>() {
        // milliseconds and microseconds epochs are too large to be seconds
        let t = if epoch > 100_000_000_000_000 {
            Utc.timestamp_micros(epoch).single()
        } else if epoch > 100_000_000_000 {
            Utc.timestamp_millis_opt(epoch).single()
        } else {
            Utc.timestamp_opt(epoch, 0).single()
        };
        return t.ok_or_else(|| AppError::ParserError(format!("invalid epoch {}", s)));
    }
    if let Ok(epoch) = s.parse::<f64>() {
        let secs = epoch.trunc() as i64;
        let ns = ((epoch - epoch.trunc()) * 1e9).round() as u32;
        return Utc
            .timestamp_opt(secs, ns)
            .single()
            .ok_or_else(|| AppError::ParserError(format!("invalid epoch {}", s)));
    }
    Err(AppError::ParserError(format!("unsupported time format {}", s)))
}

/// The zero instant used for "no time set"
pub fn zero_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

pub fn is_zero_time(t: &DateTime<Utc>) -> bool {
    *t == DateTime::<Utc>::UNIX_EPOCH
}

/// serde adapter writing a `chrono::Duration` as integer nanoseconds
pub mod duration_nanos {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(super::nanos(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }
        match Raw::deserialize(d)? {
            Raw::Int(n) => Ok(Duration::nanoseconds(n)),
            Raw::Text(t) => super::parse_duration(&t).map_err(serde::de::Error::custom),
        }
    }
}

/// Same as [`duration_nanos`] for optional fields
pub mod option_duration_nanos {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_i64(super::nanos(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<i64>::deserialize(d)?.map(Duration::nanoseconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("60").unwrap(), Duration::seconds(60));
        assert_eq!(parse_duration("60s").unwrap(), Duration::seconds(60));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_duration("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::milliseconds(250));
        assert_eq!(parse_duration("1.5").unwrap(), Duration::milliseconds(1500));
        assert_eq!(parse_duration("").unwrap(), Duration::zero());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_parse_time_forms() {
        let t = parse_time("2013-11-07T08:42:26Z").unwrap();
        assert_eq!(t.timestamp(), 1383813746);
        assert_eq!(parse_time("1383813746").unwrap(), t);
        assert_eq!(parse_time("2013-11-07 08:42:26").unwrap(), t);
        assert!(is_zero_time(&parse_time("").unwrap()));
    }
}
