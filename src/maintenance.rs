//! Maintenance window gate
//!
//! Pure decision function: given the configured weekly windows and the
//! current time, is a version upgrade allowed right now? Scaling and backups
//! are never gated.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};

use crate::crd::MaintenanceWindow;
use crate::error::{Error, Result};
use crate::schedule::parse_duration;

/// Gate outcome
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// Inside a window, or no windows configured
    Allowed,
    /// Outside every window; the next one opens after `opens_in`
    Deferred { opens_in: Duration },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }
}

/// Parse "HH:MM"
pub fn parse_start_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| Error::validation(format!("Invalid start time '{}': expected HH:MM", value)))
}

/// Decide whether an upgrade may run at `now`
///
/// Windows may span midnight or several days; an occurrence that started on
/// an earlier day and has not ended yet still counts.
pub fn evaluate(windows: &[MaintenanceWindow], now: DateTime<Utc>) -> Result<GateDecision> {
    if windows.is_empty() {
        return Ok(GateDecision::Allowed);
    }

    let today = now.date_naive();
    let mut next_open: Option<DateTime<Utc>> = None;

    for window in windows {
        if window.day_of_week > 6 {
            return Err(Error::validation(format!(
                "Invalid dayOfWeek {}: must be 0 (Sunday) through 6",
                window.day_of_week
            )));
        }
        let start_time = parse_start_time(&window.start_time)?;
        let length = parse_duration(&window.duration)?;

        for offset in -7i64..=7 {
            let day = today + Duration::days(offset);
            if day.weekday().num_days_from_sunday() != window.day_of_week {
                continue;
            }
            let start = day.and_time(start_time).and_utc();
            let end = start.checked_add_signed(length).ok_or_else(|| {
                Error::validation(format!("Window duration '{}' is out of range", window.duration))
            })?;
            if start <= now && now < end {
                return Ok(GateDecision::Allowed);
            }
            if start > now && next_open.map_or(true, |n| start < n) {
                next_open = Some(start);
            }
        }
    }

    let opens_in = next_open
        .map(|t| t - now)
        .unwrap_or_else(|| Duration::days(7));
    Ok(GateDecision::Deferred { opens_in })
}
