//! Batch analytics over occurrence history: baselines, cascades, cyclical
//! patterns and co-occurrence correlation.

pub mod baseline;
pub mod cascade;
pub mod correlation;
pub mod patterns;
pub mod runner;
pub mod stats;

use chrono::{DateTime, Duration, Utc};

use crate::detect::DetectError;

/// Build a span of `value` units with one of chrono's `try_*` constructors.
pub fn span(
    value: i64,
    make: fn(i64) -> Option<Duration>,
    what: &'static str,
) -> Result<Duration, DetectError> {
    make(value).ok_or(DetectError::OutOfRange { what, value })
}

/// `now` minus `value` units, failing when the span or the resulting
/// instant is out of range.
pub fn lookback_from(
    now: DateTime<Utc>,
    value: i64,
    make: fn(i64) -> Option<Duration>,
    what: &'static str,
) -> Result<DateTime<Utc>, DetectError> {
    now.checked_sub_signed(span(value, make, what)?)
        .ok_or(DetectError::OutOfRange { what, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_lookback_from_rejects_overflow() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(
            lookback_from(now, 24, Duration::try_hours, "hours").unwrap(),
            now - Duration::days(1)
        );
        assert!(matches!(
            lookback_from(now, i64::MAX, Duration::try_hours, "hours"),
            Err(DetectError::OutOfRange { what: "hours", value: i64::MAX })
        ));
        // Representable span, but the instant falls before chrono's range.
        assert!(lookback_from(now, 100_000_000, Duration::try_days, "days").is_err());
    }
}
