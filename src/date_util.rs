use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use crate::error::Error;

/// How checkpoint timestamps are rendered inside query filters.
///
/// Notion accepts both, but deployments behind proxies have been seen to
/// reject one or the other, so the style is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampStyle {
    /// `2024-05-05T10:00:00.000+00:00`
    #[default]
    Offset,
    /// `2024-05-05T10:00:00.000Z`
    Zulu,
}

impl TimestampStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampStyle::Offset => "offset",
            TimestampStyle::Zulu => "zulu",
        }
    }
}

impl fmt::Display for TimestampStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimestampStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "offset" => Ok(TimestampStyle::Offset),
            "zulu" | "z" => Ok(TimestampStyle::Zulu),
            other => Err(Error::Config(format!(
                "unknown timestamp style '{other}' (expected 'offset' or 'zulu')"
            ))),
        }
    }
}

/// Parse an edit/create timestamp as returned by the API.
///
/// Accepts `Z` or numeric offsets, with or without fractional seconds, and
/// falls back to a bare `YYYY-MM-DD` (interpreted as midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Offsets without a colon, e.g. `+0300`
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Convert a stored checkpoint (unix seconds) into a UTC timestamp.
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
}

/// Render a checkpoint for an `after` / `on_or_after` timestamp filter.
pub fn format_filter_timestamp(secs: i64, style: TimestampStyle) -> String {
    let dt = from_unix(secs);
    match style {
        TimestampStyle::Offset => dt.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string(),
        TimestampStyle::Zulu => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// Extract YYYY-MM-DD from an ISO datetime string.
pub fn date_key_from_iso(iso: &str) -> String {
    iso.get(..10).unwrap_or(iso).to_string()
}
