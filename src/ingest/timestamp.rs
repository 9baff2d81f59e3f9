// src/ingest/timestamp.rs
//! Resolve the many timestamp encodings upstreams use into epoch milliseconds.
//!
//! Reddit sends epoch seconds (sometimes as float), the X/Twitter timeline
//! sends `Wed Oct 10 20:19:24 +0000 2018`, Telegram exports ISO 8601 and some
//! proxies hand back locale-formatted strings. Everything that cannot be
//! resolved yields `None` and the collector drops the item.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Anything above this is treated as milliseconds rather than seconds
/// (roughly year 33658 in seconds, 2001 in millis).
const MILLIS_THRESHOLD: f64 = 1.0e12;

const TWITTER_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Naive (offset-less) formats, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d.%m.%Y, %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
    "%m/%d/%Y, %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
];

/// Epoch seconds or milliseconds to epoch millis.
pub fn from_epoch_number(n: f64) -> Option<i64> {
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    if n >= MILLIS_THRESHOLD {
        Some(n.round() as i64)
    } else {
        Some((n * 1000.0).round() as i64)
    }
}

/// Parse a string timestamp in any supported encoding.
pub fn parse_str(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(n) = s.parse::<f64>() {
        return from_epoch_number(n);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, TWITTER_FORMAT) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    None
}

/// Resolve a JSON value (number or string) to epoch millis.
pub fn parse_value(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_f64().and_then(from_epoch_number),
        Value::String(s) => parse_str(s),
        _ => None,
    }
}
