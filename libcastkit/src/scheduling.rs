//! Parsing `--at` values into publish times

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::error::{CastError, Result};

/// Parse a schedule string relative to now
pub fn parse_schedule(input: &str) -> Result<DateTime<Utc>> {
    parse_schedule_at(input, Utc::now())
}

/// Parse a schedule string relative to `now`
///
/// Accepted, in this order:
/// - RFC 3339 (`2026-03-01T09:00:00Z`, `2026-03-01T09:00:00+02:00`)
/// - `YYYY-MM-DD HH:MM` or `YYYY-MM-DD HH:MM:SS`, read as UTC
/// - durations (`30m`, `2h 15m`, `1day`), optionally prefixed with `in `
/// - natural language (`tomorrow 9am`, `next friday 14:00`)
///
/// The result must lie in the future.
pub fn parse_schedule_at(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CastError::InvalidInput(
            "Schedule time cannot be empty".to_string(),
        ));
    }

    let when = parse_absolute(input)
        .or_else(|| parse_relative(input, now))
        .or_else(|| {
            chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).ok()
        })
        .ok_or_else(|| {
            CastError::InvalidInput(format!(
                "Could not parse schedule time '{}'. Try '2h', 'tomorrow 9am' or '2026-03-01 09:00'",
                input
            ))
        })?;

    if when <= now {
        return Err(CastError::InvalidInput(format!(
            "Schedule time {} is in the past",
            when.to_rfc3339()
        )));
    }
    Ok(when)
}

fn parse_absolute(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_relative(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let duration_str = input.strip_prefix("in ").unwrap_or(input);
    let duration = humantime::parse_duration(duration_str).ok()?;
    let duration = chrono::Duration::from_std(duration).ok()?;
    now.checked_add_signed(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_rfc3339() {
        let when = parse_schedule_at("2026-03-02T08:30:00+02:00", now()).unwrap();
        assert_eq!(when, Utc.with_ymd_and_hms(2026, 3, 2, 6, 30, 0).unwrap());
    }

    #[test]
    fn test_plain_datetime_is_utc() {
        let when = parse_schedule_at("2026-03-01 15:45", now()).unwrap();
        assert_eq!(when, Utc.with_ymd_and_hms(2026, 3, 1, 15, 45, 0).unwrap());
    }

    #[test]
    fn test_durations() {
        assert_eq!(
            parse_schedule_at("30m", now()).unwrap(),
            now() + chrono::Duration::minutes(30)
        );
        assert_eq!(
            parse_schedule_at("in 2h", now()).unwrap(),
            now() + chrono::Duration::hours(2)
        );
        assert_eq!(
            parse_schedule_at("1h 30m", now()).unwrap(),
            now() + chrono::Duration::minutes(90)
        );
    }

    #[test]
    fn test_natural_language() {
        let when = parse_schedule_at("tomorrow", now()).unwrap();
        assert!(when > now());
        assert!(when <= now() + chrono::Duration::days(2));
    }

    #[test]
    fn test_past_is_rejected() {
        let err = parse_schedule_at("2026-02-28 09:00", now()).unwrap_err();
        assert!(err.to_string().contains("in the past"));
        assert!(parse_schedule_at("0s", now()).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = parse_schedule_at("whenever you like", now()).unwrap_err();
        assert!(matches!(err, CastError::InvalidInput(_)));
        assert!(parse_schedule_at("   ", now()).is_err());
    }
}
