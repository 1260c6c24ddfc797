use serde_json::{Map, Value};
use thiserror::Error;

use crate::literal::parse_literal;
use crate::mapping::MAPPED_FIELDS;

/// Enumeration of reasons a `StreamRecord` cannot be turned into an event.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record has no fields")]
    EmptyRecord,
    #[error("event_id must be a string or a number, got {0}")]
    InvalidEventId(String),
}

/// Decode the flat field map of a stream record into a JSON object.
///
/// Rules, in order:
/// 1. A record made of a single field that is not one of the mapped event attributes, and
///    whose value is a JSON object, is an embedded event: that object becomes the record.
/// 2. `metadata` is parsed as JSON whatever its shape, then as a data literal, and only then
///    kept as the raw string.
/// 3. Any other value that looks structured (`{...}` or `[...]`) is parsed as JSON when it can
///    be; everything else stays a string.
pub fn decode_fields<'a, I>(fields: I) -> Result<Map<String, Value>, DecodeError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let fields: Vec<(&String, &String)> = fields.into_iter().collect();

    if let [(name, raw)] = fields.as_slice() {
        if !MAPPED_FIELDS.contains(&name.as_str()) {
            if let Ok(Value::Object(embedded)) = serde_json::from_str::<Value>(raw.trim()) {
                return Ok(embedded);
            }
        }
    }

    if fields.is_empty() {
        return Err(DecodeError::EmptyRecord);
    }

    Ok(fields
        .into_iter()
        .map(|(name, raw)| (name.clone(), decode_value(name, raw)))
        .collect())
}

/// Decode a single field value.
pub fn decode_value(name: &str, raw: &str) -> Value {
    if name == "metadata" {
        return serde_json::from_str(raw)
            .or_else(|_| parse_literal(raw))
            .unwrap_or_else(|_| Value::String(raw.to_owned()));
    }

    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str(raw) {
            return value;
        }
    }
    Value::String(raw.to_owned())
}
