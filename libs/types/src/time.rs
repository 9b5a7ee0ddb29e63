//! Unix-nanosecond clock helpers
//!
//! All timestamps inside the stream are `i64` Unix nanoseconds; conversion to
//! milliseconds (wire) and `DateTime<Utc>` (storage) happens at the edges.

use chrono::{DateTime, TimeZone, Utc};

pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Current wall-clock time in Unix nanoseconds.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Truncate Unix nanoseconds to Unix milliseconds.
pub fn nanos_to_millis(nanos: i64) -> i64 {
    nanos.div_euclid(NANOS_PER_MILLI)
}

/// Convert Unix nanoseconds to a UTC datetime.
pub fn nanos_to_datetime(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos_to_millis() {
        assert_eq!(nanos_to_millis(1_708_123_456_789_123_456), 1_708_123_456_789);
        assert_eq!(nanos_to_millis(-1), -1);
    }

    #[test]
    fn test_nanos_to_datetime_roundtrip() {
        let nanos = 1_708_123_456_789_000_000;
        let dt = nanos_to_datetime(nanos);
        assert_eq!(dt.timestamp_nanos_opt(), Some(nanos));
    }

    #[test]
    fn test_now_is_after_2024() {
        assert!(now_nanos() > 1_704_067_200 * NANOS_PER_SEC);
    }
}
