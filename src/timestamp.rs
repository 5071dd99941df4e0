use chrono::{ DateTime, NaiveDateTime, TimeZone, Utc };
use thiserror::Error;

// up to 10 digits is epoch seconds, 11 to 13 is epoch milliseconds
const MAX_EPOCH_DIGITS: usize = 13;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S UTC",
    "%Y-%m-%d %H:%M:%S%.f UTC",
];

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot parse timestamp {value:?}: {reason}")]
pub struct ParseError {
    pub value: String,
    pub reason: String,
}

impl ParseError {
    fn new(value: &str, reason: impl Into<String>) -> Self {
        ParseError { value: value.to_string(), reason: reason.into() }
    }
}

pub trait TimestampParser: Send + Sync {
    fn parse(&self, vendor_string: &str) -> Result<DateTime<Utc>, ParseError>;
}

/// Accepts the formats both vendors emit: RFC 3339, ISO 8601 without a zone
/// (taken as UTC), numeric offsets without a colon, `... UTC` suffixes, and
/// epoch seconds or milliseconds as a bare integer.
#[derive(Default, Clone, Copy, Debug)]
pub struct VendorTimestampParser;

impl TimestampParser for VendorTimestampParser {
    fn parse(&self, vendor_string: &str) -> Result<DateTime<Utc>, ParseError> {
        let s = vendor_string.trim();
        if s.is_empty() {
            return Err(ParseError::new(vendor_string, "empty value"));
        }
        if s.chars().all(|c| c.is_ascii_digit()) {
            return parse_epoch(vendor_string, s);
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Ok(t.with_timezone(&Utc));
        }
        for f in OFFSET_FORMATS {
            if let Ok(t) = DateTime::parse_from_str(s, f) {
                return Ok(t.with_timezone(&Utc));
            }
        }
        for f in NAIVE_FORMATS {
            if let Ok(t) = NaiveDateTime::parse_from_str(s, f) {
                return Ok(Utc.from_utc_datetime(&t));
            }
        }
        Err(ParseError::new(vendor_string, "unrecognized format"))
    }
}

fn parse_epoch(input: &str, digits: &str) -> Result<DateTime<Utc>, ParseError> {
    if digits.len() > MAX_EPOCH_DIGITS {
        return Err(ParseError::new(input, "epoch value out of range"));
    }
    let n: i64 = digits.parse().map_err(|e: std::num::ParseIntError| ParseError::new(input, e.to_string()))?;
    let t = if digits.len() > 10 { Utc.timestamp_millis_opt(n) } else { Utc.timestamp_opt(n, 0) };
    t.single().ok_or_else(|| ParseError::new(input, "epoch value out of range"))
}
