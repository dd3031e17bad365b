// ABOUTME: Parses relative time windows such as "7d" or "24h" for run queries.
// ABOUTME: Converts them into an absolute lower bound for ListQuery::since.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("empty duration")]
    Empty,

    #[error("invalid duration {0:?}: expected a number followed by d, h, m, or s")]
    Invalid(String),
}

/// Parse a relative window: an integer followed by `d`, `h`, `m`, or `s`.
pub fn parse_window(input: &str) -> Result<Duration, DurationParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let invalid = || DurationParseError::Invalid(input.to_string());
    let unit = input.chars().last().ok_or_else(invalid)?;
    let digits = &input[..input.len() - unit.len_utf8()];
    let amount: i64 = digits.parse().map_err(|_| invalid())?;
    if amount < 0 {
        return Err(invalid());
    }

    match unit {
        'd' => Duration::try_days(amount),
        'h' => Duration::try_hours(amount),
        'm' => Duration::try_minutes(amount),
        's' => Duration::try_seconds(amount),
        _ => None,
    }
    .ok_or_else(invalid)
}

/// Resolve a relative window against `now`.
pub fn since(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, DurationParseError> {
    let window = parse_window(input)?;
    now.checked_sub_signed(window)
        .ok_or_else(|| DurationParseError::Invalid(input.trim().to_string()))
}
