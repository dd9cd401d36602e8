use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Key under which non-object payloads are stored when a map is required.
pub const WRAPPED_DATA_KEY: &str = "value";

/// Fields checked (in order) for a correlation key inside the payload.
const CORRELATION_FIELDS: [&str; 3] = ["id", "aggregate_id", "correlation_id"];

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("envelope has an empty event type")]
    MissingType,
}

/// The wire format shared by the publisher and consumer.
///
/// ```text
/// {"type": "user.created", "data": {...}, "timestamp": "2024-01-01T00:00:00Z", "version": 1}
/// ```
///
/// This is the only on-wire format the pipeline defines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub data: JsonValue,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            version: default_version(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)?;
        if envelope.event_type.trim().is_empty() {
            return Err(EnvelopeError::MissingType);
        }
        Ok(envelope)
    }

    /// Identifier embedded in the payload, if any.
    ///
    /// Checks `id`, then `aggregate_id`, then `correlation_id`. Numeric values
    /// are accepted and rendered as strings.
    pub fn correlation_key(&self) -> Option<String> {
        let obj = self.data.as_object()?;
        CORRELATION_FIELDS.iter().find_map(|field| match obj.get(*field) {
            Some(JsonValue::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn has_object_data(&self) -> bool {
        self.data.is_object()
    }

    /// The payload as a JSON object.
    ///
    /// Non-object payloads are wrapped under [`WRAPPED_DATA_KEY`].
    pub fn data_map(&self) -> Map<String, JsonValue> {
        match &self.data {
            JsonValue::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert(WRAPPED_DATA_KEY.to_string(), other.clone());
                map
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_with_wire_field_names() {
        let envelope = EventEnvelope::new("user.created", json!({"id": "u-1"}));
        let value: JsonValue = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "user.created");
        assert_eq!(value["data"]["id"], "u-1");
        assert_eq!(value["version"], 1);
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn decodes_rfc3339_timestamp() {
        let raw = concat!(
            r#"{"type":"user.created","data":{"id":"u-1"},"#,
            r#""timestamp":"2024-03-01T12:00:00Z","version":3}"#,
        );
        let envelope = EventEnvelope::decode(raw.as_bytes()).unwrap();

        assert_eq!(envelope.version, 3);
        assert_eq!(envelope.timestamp.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn rejects_malformed_and_untyped_payloads() {
        assert!(matches!(
            EventEnvelope::decode(b"not json"),
            Err(EnvelopeError::Decode(_))
        ));
        assert!(matches!(
            EventEnvelope::decode(br#"{"type":"  ","data":{}}"#),
            Err(EnvelopeError::MissingType)
        ));
    }

    #[test]
    fn correlation_key_prefers_id_then_aggregate_id() {
        let with_id = EventEnvelope::new("t", json!({"id": "a", "aggregate_id": "b"}));
        let with_agg = EventEnvelope::new("t", json!({"aggregate_id": "b"}));
        let numeric = EventEnvelope::new("t", json!({"id": 42}));
        let none = EventEnvelope::new("t", json!([1, 2]));

        assert_eq!(with_id.correlation_key().as_deref(), Some("a"));
        assert_eq!(with_agg.correlation_key().as_deref(), Some("b"));
        assert_eq!(numeric.correlation_key().as_deref(), Some("42"));
        assert_eq!(none.correlation_key(), None);
    }

    #[test]
    fn scalar_data_is_wrapped_in_map() {
        let envelope = EventEnvelope::new("t", json!(7));
        let map = envelope.data_map();
        assert_eq!(map.get(WRAPPED_DATA_KEY), Some(&json!(7)));
        assert!(!envelope.has_object_data());
    }
}
