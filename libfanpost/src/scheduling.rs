//! Parsing of `scheduled_at` values
//!
//! Accepted forms, tried in order:
//! - RFC 3339 timestamps: `2026-11-20T15:00:00Z`
//! - `now`
//! - Relative durations: `30m`, `2h 30min`
//! - Natural language: `tomorrow`, `next monday 10am`

use chrono::{DateTime, Duration, Utc};

use crate::error::{FanpostError, Result};

/// Parse a schedule string relative to `now`
///
/// Past timestamps are accepted; such posts are released on the next tick.
///
/// # Errors
///
/// Returns `InvalidSchedule` if the input matches none of the accepted forms.
pub fn parse_scheduled_at(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(FanpostError::InvalidSchedule(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Some(duration) = parse_duration(input) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|_| {
        FanpostError::InvalidSchedule(format!("Could not parse schedule string: {}", input))
    })
}

fn parse_duration(input: &str) -> Option<Duration> {
    let std_duration = humantime::parse_duration(input).ok()?;
    Duration::from_std(std_duration).ok()
}
