use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::EventId;

use crate::envelope::{EnvelopeError, EventEnvelope};

/// A typed domain event that can be handed to the pipeline.
///
/// Domain events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **named** by a stable type string (e.g. "user.created"), which is also
///   the default topic when no mapping exists
pub trait DomainEvent: Serialize {
    /// Stable event name/type identifier (e.g. "user.created").
    fn event_type(&self) -> &str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Identifier of the entity the event is about, if any.
    fn aggregate_id(&self) -> Option<String> {
        None
    }
}

/// Type-erased domain event, as transported by the publisher.
///
/// `data` is the JSON form of the typed payload; the pipeline never looks
/// inside it except to extract a correlation key on the consuming side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub aggregate_id: Option<String>,
    pub data: JsonValue,
    pub occurred_at: DateTime<Utc>,
    pub version: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            aggregate_id: None,
            data,
            occurred_at: Utc::now(),
            version: 1,
            metadata: HashMap::new(),
        }
    }

    /// Erase a typed domain event, capturing its metadata.
    pub fn from_domain<E: DomainEvent>(event: &E) -> Result<Self, EnvelopeError> {
        let data = serde_json::to_value(event).map_err(EnvelopeError::Encode)?;
        Ok(Self {
            id: EventId::new(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id(),
            data,
            occurred_at: event.occurred_at(),
            version: event.version(),
            metadata: HashMap::new(),
        })
    }

    pub fn with_aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Wire representation of this event.
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_type: self.event_type.clone(),
            data: self.data.clone(),
            timestamp: self.occurred_at,
            version: self.version,
        }
    }
}
