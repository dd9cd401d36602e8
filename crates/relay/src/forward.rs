//! Re-routing of consumed events through the publisher.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{debug, warn};

use courier_core::Context;
use courier_events::{Broker, Event, EventEnvelope};
use courier_infra::{EventPublisher, SubmitError};

/// Republishes consumed events whose routed topic is not one this relay
/// consumes itself, so an event is never fed back into its own input.
pub struct Forwarder<B: Broker + 'static> {
    publisher: Arc<EventPublisher<B>>,
    consumed: HashSet<String>,
    ctx: Context,
}

impl<B: Broker + 'static> Forwarder<B> {
    pub fn new<I, S>(publisher: Arc<EventPublisher<B>>, consumed: I, ctx: Context) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            publisher,
            consumed: consumed.into_iter().map(Into::into).collect(),
            ctx,
        }
    }

    /// Destination for `envelope`, or `None` if it routes back to a consumed topic.
    pub fn target<'a>(&'a self, envelope: &'a EventEnvelope) -> Option<&'a str> {
        let topic = self.publisher.topic_for(&envelope.event_type);
        (!self.consumed.contains(topic)).then_some(topic)
    }

    pub fn forward(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        let Some(topic) = self.target(envelope) else {
            debug!(
                event_type = %envelope.event_type,
                "event routes to a consumed topic; not forwarded"
            );
            return Ok(());
        };

        let mut event = Event::new(envelope.event_type.clone(), envelope.data.clone())
            .with_version(envelope.version);
        event.occurred_at = envelope.timestamp;
        if let Some(key) = envelope.correlation_key() {
            event = event.with_aggregate_id(key);
        }

        match self.publisher.publish_event(&self.ctx, event) {
            Ok(outcome) => {
                debug!(event_type = %envelope.event_type, %topic, ?outcome, "event forwarded");
                Ok(())
            }
            // Already dead-lettered by the publisher.
            Err(e @ (SubmitError::Inline(_) | SubmitError::Panicked { .. })) => {
                warn!(
                    event_type = %envelope.event_type,
                    %topic,
                    error = %e,
                    "inline forward failed"
                );
                Ok(())
            }
            Err(e) => Err(e).with_context(|| {
                format!("forwarding {} to {topic}", envelope.event_type)
            }),
        }
    }
}
