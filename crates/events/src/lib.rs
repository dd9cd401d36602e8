//! Events as they travel through the pipeline: the domain event handed to the
//! publisher, the JSON envelope on the wire, and the broker seam in between.

pub mod broker;
pub mod envelope;
pub mod event;
pub mod in_memory_broker;
pub mod topic;

pub use broker::{Broker, BrokerMessage, Subscription};
pub use envelope::{EnvelopeError, EventEnvelope, WRAPPED_DATA_KEY};
pub use event::{DomainEvent, Event};
pub use in_memory_broker::{InMemoryBroker, InMemoryBrokerError};
pub use topic::{TopicMap, TopicMapParseError};
