//! Telemetry freshness gate. Anything that cannot be proven fresh fails.

use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FreshnessError {
    #[error("no timestamp for metric")]
    Missing,
    #[error("unparseable timestamp '{0}'")]
    Unparseable(String),
    #[error("telemetry is {age_secs:.0}s old")]
    Stale { age_secs: f64 },
    #[error("timestamp is {ahead_secs:.0}s in the future")]
    Future { ahead_secs: f64 },
}

impl FreshnessError {
    pub fn is_stale(&self) -> bool {
        matches!(self, FreshnessError::Stale { .. })
    }
}

/// Parses RFC 3339, or a naive `YYYY-MM-DD[T ]HH:MM:SS[.f]` taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    let normalized = match raw.as_bytes().get(10) {
        Some(b' ') => format!("{}T{}", &raw[..10], &raw[11..]),
        _ => raw.to_string(),
    };

    if let Ok(ts) = OffsetDateTime::parse(&normalized, &Rfc3339) {
        return Some(ts);
    }

    let with_fraction = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    let plain = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    PrimitiveDateTime::parse(&normalized, &with_fraction)
        .or_else(|_| PrimitiveDateTime::parse(&normalized, &plain))
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// Returns the sample age in seconds when fresh.
pub fn check_freshness(
    raw: Option<&str>,
    now: OffsetDateTime,
    max_age: Duration,
    max_skew: Duration,
) -> Result<f64, FreshnessError> {
    let raw = raw.filter(|s| !s.trim().is_empty()).ok_or(FreshnessError::Missing)?;
    let ts = parse_timestamp(raw).ok_or_else(|| FreshnessError::Unparseable(raw.to_string()))?;

    let age_secs = (now - ts).as_seconds_f64();
    if age_secs < 0.0 {
        let ahead_secs = -age_secs;
        if ahead_secs > max_skew.as_secs_f64() {
            return Err(FreshnessError::Future { ahead_secs });
        }
        return Ok(0.0);
    }
    if age_secs > max_age.as_secs_f64() {
        return Err(FreshnessError::Stale { age_secs });
    }
    Ok(age_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-01 12:00:00 UTC);

    fn check(raw: Option<&str>) -> Result<f64, FreshnessError> {
        check_freshness(raw, NOW, Duration::from_secs(300), Duration::from_secs(60))
    }

    #[test]
    fn accepts_rfc3339_and_naive_utc() {
        assert_eq!(check(Some("2026-03-01T11:58:00Z")), Ok(120.0));
        assert_eq!(check(Some("2026-03-01T13:58:00+02:00")), Ok(120.0));
        assert_eq!(check(Some("2026-03-01 11:59:00")), Ok(60.0));
        assert_eq!(check(Some("2026-03-01T11:59:30.500")), Ok(29.5));
    }

    #[test]
    fn missing_or_garbage_fails_closed() {
        assert_eq!(check(None), Err(FreshnessError::Missing));
        assert_eq!(check(Some("  ")), Err(FreshnessError::Missing));
        assert!(matches!(check(Some("yesterday")), Err(FreshnessError::Unparseable(_))));
    }

    #[test]
    fn stale_and_future_samples_are_rejected() {
        let stale = check(Some("2026-03-01T11:50:00Z")).unwrap_err();
        assert!(stale.is_stale());
        assert!(matches!(check(Some("2026-03-01T12:05:00Z")), Err(FreshnessError::Future { .. })));
        assert_eq!(check(Some("2026-03-01T12:00:30Z")), Ok(0.0));
    }
}
