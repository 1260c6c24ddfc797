use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::decode::DecodeError;
use crate::routing;

/// A message as delivered by the broker: a flat map of fields, keyed by stream and message id.
/// The broker owns it until it is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub stream: String,
    /// Broker assigned id, `<millis>-<sequence>`.
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamRecord {
    pub fn new(stream: &str, id: &str, fields: HashMap<String, String>) -> Self {
        Self {
            stream: stream.to_owned(),
            id: id.to_owned(),
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Security,
    Agent,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Security => "security",
            Category::Agent => "agent",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event normalized from a `StreamRecord`, ready to be written to the document store.
///
/// `fields` holds the whole decoded record, including `event_id` and the normalized
/// `timestamp`. Processing metadata is only stamped by `into_document`.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub event_id: String,
    pub category: Category,
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

impl CanonicalEvent {
    /// Build an event out of decoded fields.
    ///
    /// A record without a usable `event_id` gets one derived from its stream position, so that
    /// a redelivery of the same message overwrites the same document. An unusable raw id is
    /// kept under `original_event_id`. An unparsable or missing
    /// timestamp falls back to `now`; the raw value is kept under `original_timestamp`.
    pub fn from_fields(
        record: &StreamRecord,
        mut fields: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Self, DecodeError> {
        let event_id = match fields.get("event_id") {
            Some(Value::String(id)) if is_addressable(id) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            None | Some(Value::Null) | Some(Value::String(_)) => {
                format!("auto-{}-{}", record.stream, record.id)
            }
            Some(other) => return Err(DecodeError::InvalidEventId(other.to_string())),
        };
        if let Some(Value::String(raw)) = fields.get("event_id") {
            if raw != &event_id && !raw.trim().is_empty() {
                let raw = raw.clone();
                fields.insert("original_event_id".to_owned(), Value::String(raw));
            }
        }
        fields.insert("event_id".to_owned(), Value::String(event_id.clone()));

        let category = routing::category_of(&fields);

        let parsed = fields
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(routing::parse_timestamp);
        let timestamp = match parsed {
            Some(timestamp) => timestamp,
            None => {
                if let Some(raw) = fields.remove("timestamp") {
                    fields.insert("original_timestamp".to_owned(), raw);
                }
                now
            }
        };
        fields.insert(
            "timestamp".to_owned(),
            Value::String(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );

        Ok(Self {
            event_id,
            category,
            timestamp,
            fields,
        })
    }

    /// Name of the date partition this event belongs to.
    pub fn index_name(&self) -> String {
        routing::index_name(self.category, &self.timestamp)
    }

    /// The document body, stamped with processing metadata.
    pub fn into_document(self, processed_by: &str, processed_at: DateTime<Utc>) -> Value {
        let mut fields = self.fields;
        fields.insert(
            "processed_at".to_owned(),
            Value::String(processed_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        fields.insert(
            "processed_by".to_owned(),
            Value::String(processed_by.to_owned()),
        );
        Value::Object(fields)
    }
}

/// Whether `id` can name a document. Dot segments cannot appear in a document path.
pub fn is_addressable(id: &str) -> bool {
    !id.trim().is_empty() && id != "." && id != ".."
}
