use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use courier_core::FailedEventId;
use courier_events::{EventEnvelope, WRAPPED_DATA_KEY};

/// Well-known keys in [`FailedEvent::metadata`].
pub mod metadata_keys {
    /// Subsystem that dead-lettered the event (`publisher`, `consumer`).
    pub const SOURCE: &str = "source";
    pub const WORKER_ID: &str = "worker_id";
    pub const EVENT_ID: &str = "event_id";
    pub const AGGREGATE_ID: &str = "aggregate_id";
    pub const CORRELATION_KEY: &str = "correlation_key";
    /// Attempts spent by the pool before the event was dead-lettered.
    pub const ATTEMPTS: &str = "attempts";
    pub const ENVELOPE_VERSION: &str = "envelope_version";
    pub const ENVELOPE_TIMESTAMP: &str = "envelope_timestamp";
    /// Set when a non-object payload was wrapped to fit `event_data`.
    pub const DATA_WRAPPED: &str = "data_wrapped";
}

/// A permanently failed event held by the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub id: FailedEventId,
    pub event_type: String,
    pub event_data: Map<String, JsonValue>,
    /// Last error observed for this event
    pub error: String,
    /// When the event was dead-lettered or last retried
    pub timestamp: DateTime<Utc>,
    /// Manual retries performed so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub topic: Option<String>,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl FailedEvent {
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get(metadata_keys::SOURCE).map(String::as_str)
    }

    /// Rebuild the wire envelope this entry was captured from.
    ///
    /// Version and timestamp come from metadata when present; a wrapped
    /// scalar payload is unwrapped again.
    pub fn to_envelope(&self) -> EventEnvelope {
        let wrapped = self
            .metadata
            .get(metadata_keys::DATA_WRAPPED)
            .is_some_and(|v| v == "true");

        let data = if wrapped {
            self.event_data
                .get(WRAPPED_DATA_KEY)
                .cloned()
                .unwrap_or(JsonValue::Null)
        } else {
            JsonValue::Object(self.event_data.clone())
        };

        let timestamp = self
            .metadata
            .get(metadata_keys::ENVELOPE_TIMESTAMP)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map_or(self.timestamp, |t| t.with_timezone(&Utc));

        let version = self
            .metadata
            .get(metadata_keys::ENVELOPE_VERSION)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1);

        EventEnvelope {
            event_type: self.event_type.clone(),
            data,
            timestamp,
            version,
        }
    }
}

/// Metadata needed to rebuild `envelope` from a [`FailedEvent`].
pub fn envelope_metadata(envelope: &EventEnvelope) -> HashMap<String, String> {
    let mut metadata = HashMap::from([
        (
            metadata_keys::ENVELOPE_VERSION.to_string(),
            envelope.version.to_string(),
        ),
        (
            metadata_keys::ENVELOPE_TIMESTAMP.to_string(),
            envelope.timestamp.to_rfc3339(),
        ),
    ]);
    if !envelope.has_object_data() {
        metadata.insert(metadata_keys::DATA_WRAPPED.to_string(), "true".to_string());
    }
    metadata
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqConfig {
    /// Maximum entries held across storage and memory
    pub max_size: usize,
    /// Manual retries allowed per entry
    pub max_attempts: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_attempts: 3,
        }
    }
}

impl DlqConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqStats {
    pub total: usize,
    pub max_size: usize,
    pub utilization_percent: f64,
    pub by_event_type: BTreeMap<String, usize>,
}
