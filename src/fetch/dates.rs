//! Pluggable date parsing.
//!
//! Historical USENET Date headers vary widely, so the parser is a trait
//! hook. The default chrono-backed adapter accepts RFC 2822 (including
//! the obsolete two-digit-year forms chrono tolerates), RFC 3339, and
//! the SQL-ish `YYYY-MM-DD HH:MM:SS[.ffffff]` shapes, with trailing
//! comments like `(UTC)` stripped first.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

pub trait DateParser: Send + Sync {
    fn parse(&self, raw: &str) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChronoDateParser;

impl ChronoDateParser {
    /// Drop a trailing parenthesized comment: `... +0000 (UTC)`.
    fn strip_comment(raw: &str) -> &str {
        match raw.rfind('(') {
            Some(idx) => raw[..idx].trim(),
            None => raw.trim(),
        }
    }
}

impl DateParser for ChronoDateParser {
    fn parse(&self, raw: &str) -> Option<DateTime<Utc>> {
        let cleaned = Self::strip_comment(raw);
        if cleaned.is_empty() {
            return None;
        }

        if let Ok(dt) = DateTime::parse_from_rfc2822(cleaned) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(cleaned) {
            return Some(dt.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(cleaned, format) {
                return Some(naive.and_utc());
            }
        }
        // RFC 2822 without a weekday but with a named zone chrono's
        // rfc2822 parser rejects, e.g. "1 Jan 2024 00:00:00 GMT".
        for format in ["%d %b %Y %H:%M:%S GMT", "%d %b %Y %H:%M:%S UT"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(cleaned, format) {
                return Some(naive.and_utc());
            }
        }
        None
    }
}

/// Parse a `--download-start-date` day (YYYY-MM-DD) as midnight UTC.
pub fn parse_start_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
