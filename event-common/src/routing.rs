use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::event::Category;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Events carrying a `threat_type` field are security events, everything else comes from agents.
pub fn category_of(fields: &Map<String, Value>) -> Category {
    if fields.contains_key("threat_type") {
        Category::Security
    } else {
        Category::Agent
    }
}

/// Parse an ISO 8601 timestamp into UTC.
///
/// Accepts RFC 3339 (`Z` or numeric offsets, also with a space separator), naive date-times
/// which are taken as UTC, and bare dates (midnight UTC). Returns `None` for anything else.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let normalized = match raw.strip_suffix('Z').or_else(|| raw.strip_suffix('z')) {
        Some(rest) => format!("{rest}+00:00"),
        None => raw.to_owned(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// `{category}-events-{YYYY.MM.DD}`, using the UTC date of `timestamp`.
pub fn index_name(category: Category, timestamp: &DateTime<Utc>) -> String {
    format!("{}-events-{}", category, timestamp.format("%Y.%m.%d"))
}
