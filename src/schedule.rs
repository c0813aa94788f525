//! Cron schedule and duration parsing shared by rotation, backups and
//! maintenance windows

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::error::{Error, Result};

/// Parse a cron expression, accepting the classic 5-field form
///
/// The `cron` crate expects a leading seconds field, so 5-field expressions
/// are anchored at second zero.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {}", trimmed),
        _ => trimmed.to_string(),
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::validation(format!("Invalid cron schedule '{}': {}", expression, e)))
}

/// First firing strictly after `after`
pub fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Parse a Go-style duration such as `4h`, `1h30m` or `90s`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::validation(format!("Invalid duration '{}'", input));
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::zero());
    }

    let mut total = Duration::zero();
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: i64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "h" => Duration::try_hours(value),
            "m" => Duration::try_minutes(value),
            "s" => Duration::try_seconds(value),
            "ms" => Duration::try_milliseconds(value),
            _ => return Err(invalid()),
        };
        total = part
            .and_then(|part| total.checked_add(&part))
            .ok_or_else(|| Error::validation(format!("Duration '{}' is out of range", input)))?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("4h").unwrap(), Duration::hours(4));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("90s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_duration("2h0m0s").unwrap(), Duration::hours(2));
        assert_eq!(parse_duration("0").unwrap(), Duration::zero());
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for bad in ["", "h", "4", "4d", "1.5h", "-1h", "4h30"] {
            assert!(parse_duration(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        for huge in ["9999999999999h", "9223372036854775807ms9223372036854775807ms", "99999999999999999999s"] {
            assert!(parse_duration(huge).is_err(), "accepted {:?}", huge);
        }
        let err = parse_duration("9999999999999h").unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_five_field_schedule() {
        let schedule = parse_schedule("0 2 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap();
        assert_eq!(
            next_after(&schedule, from),
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_six_field_schedule_passthrough() {
        assert!(parse_schedule("30 0 2 * * *").is_ok());
    }

    #[test]
    fn test_invalid_schedule() {
        let err = parse_schedule("not a cron").unwrap_err();
        assert!(err.to_string().contains("Invalid cron schedule"));
    }
}
