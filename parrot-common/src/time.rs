//! Timestamp utilities

use chrono::{DateTime, TimeZone, Utc};

/// Current time as Unix milliseconds (queue scheduling resolution)
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert Unix milliseconds back into a UTC timestamp
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH))
}

/// Parse an RFC 3339 timestamp as stored in the metadata tables
pub fn parse_rfc3339(value: &str) -> crate::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::Error::Internal(format!("Failed to parse timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip_preserves_instant() {
        let millis = 1_700_000_000_123;
        assert_eq!(from_millis(millis).timestamp_millis(), millis);
    }

    #[test]
    fn test_parse_rfc3339_rejects_garbage() {
        assert!(parse_rfc3339("yesterday").is_err());
        let parsed = parse_rfc3339("2024-05-01T12:00:00Z").unwrap();
        assert_eq!(parsed.timestamp(), 1_714_564_800);
    }
}
