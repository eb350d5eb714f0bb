//! Timestamp helpers shared by stores and token services.
//!
//! Persisted timestamps are RFC 3339 UTC with microsecond precision so the
//! string form sorts chronologically; signed token claims use unix seconds.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current UTC time.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Formats a timestamp in the persisted RFC 3339 form.
#[must_use]
pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a persisted RFC 3339 timestamp.
///
/// # Errors
///
/// Returns the underlying parse error for malformed input.
pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Unix seconds for token claims.
#[must_use]
pub fn unix_seconds(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_roundtrip() {
        let now = now();
        let parsed = parse_rfc3339(&to_rfc3339(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn rfc3339_sorts_chronologically() {
        let a = to_rfc3339(parse_rfc3339("2026-01-01T00:00:00Z").unwrap());
        let b = to_rfc3339(parse_rfc3339("2026-01-02T00:00:00Z").unwrap());
        assert!(a < b);
    }
}
