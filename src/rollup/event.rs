use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::RollupError;

/// A successfully persisted source event, as delivered by the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    /// Collection or model name the event was persisted into.
    pub source: String,
    /// Identifier assigned by the persistence layer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Creation time of the persisted event.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Field values of the event.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl SourceEvent {
    /// Creates an event with the given creation time and fields.
    pub fn new(source: impl Into<String>, created_at: DateTime<Utc>, fields: Map<String, Value>) -> Self {
        Self {
            source: source.into(),
            id: None,
            created_at,
            fields,
        }
    }

    /// Returns a top-level field, treating null as absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    /// Resolves a dotted path such as `request.timing.loadMs`.
    ///
    /// Fails closed: any missing segment, non-object intermediate, or null
    /// leaf yields `None`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    /// Resolves the timestamp this event is bucketed by.
    ///
    /// Without a date field the creation time is used. A date field may hold
    /// an RFC 3339 string or epoch milliseconds.
    pub fn timestamp(&self, series: &str, date_field: Option<&str>) -> Result<DateTime<Utc>, RollupError> {
        let Some(field) = date_field else {
            return Ok(self.created_at);
        };

        let value = self
            .lookup(field)
            .ok_or_else(|| RollupError::MissingTimestamp {
                series: series.to_string(),
                field: field.to_string(),
            })?;

        parse_timestamp(value).ok_or_else(|| RollupError::InvalidTimestamp {
            series: series.to_string(),
            field: field.to_string(),
        })
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = match n.as_i64() {
                Some(ms) => ms,
                None => n.as_f64().filter(|f| f.is_finite())? as i64,
            };
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}
