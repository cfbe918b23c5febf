//! Wire time formats.
//!
//! Two ISO-8601 shapes exist on the wire: the canonical form with separators
//! (`2026-02-17T10:00:00.250000`) for API fields, and the packed form
//! (`20260217T100000.250000`) for `file_time` and storage keys.  Event
//! timestamps travel as epoch seconds with fractional microseconds.
//! Parsing accepts either shape, with or without fractional digits.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

pub type Time = DateTime<Utc>;

const ISO_FMT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const ISO_PACKED_FMT: &str = "%Y%m%dT%H%M%S%.6f";

/// Canonical form for API fields.
pub fn to_iso(t: Time) -> String {
    t.format(ISO_FMT).to_string()
}

/// Packed form for storage keys and `file_time`.
pub fn to_iso_packed(t: Time) -> String {
    t.format(ISO_PACKED_FMT).to_string()
}

/// Parse either ISO shape.  A trailing `Z` is tolerated.
pub fn from_iso(s: &str) -> Option<Time> {
    let s = s.trim().trim_end_matches('Z');
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y%m%dT%H%M%S%.f",
        "%Y%m%dT%H%M%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Epoch seconds with fractional microseconds, the `event_object.time` form.
pub fn to_epoch(t: Time) -> f64 {
    t.timestamp() as f64 + f64::from(t.timestamp_subsec_micros()) / 1_000_000.0
}

/// Inverse of [`to_epoch`]; rejects non-finite and out-of-range values.
pub fn from_epoch(secs: f64) -> Option<Time> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let whole = secs.trunc() as i64;
    let micros = (secs.fract() * 1_000_000.0).round() as u32;
    Utc.timestamp_opt(whole, micros * 1000).single()
}
