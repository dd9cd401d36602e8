//! In-memory broker for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::broker::{Broker, BrokerMessage, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBrokerError {
    /// Internal lock poisoning.
    #[error("in-memory broker lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// One single-partition log per topic; the offset is the index.
    logs: HashMap<String, Vec<Vec<u8>>>,
    subscribers: Vec<(Vec<String>, mpsc::Sender<BrokerMessage>)>,
}

/// In-memory topic broker.
///
/// - No IO / no async
/// - Every topic has a single partition (0) with a retained log
/// - Best-effort fan-out to live subscribers of the topic
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything ever published to `topic`, in offset order.
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|s| s.logs.get(topic).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Total number of messages published across all topics.
    pub fn published_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.logs.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

impl Broker for InMemoryBroker {
    type Error = InMemoryBrokerError;

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.state.lock().map_err(|_| InMemoryBrokerError::Poisoned)?;

        let log = state.logs.entry(topic.to_string()).or_default();
        let offset = log.len() as i64;
        log.push(payload.to_vec());

        let message = BrokerMessage::new(topic, 0, offset, payload.to_vec());

        // Drop any dead subscribers while publishing.
        state.subscribers.retain(|(topics, tx)| {
            if topics.iter().any(|t| t == topic) {
                tx.send(message.clone()).is_ok()
            } else {
                true
            }
        });

        Ok(())
    }

    fn subscribe(&self, topics: &[&str]) -> Result<Subscription<BrokerMessage>, Self::Error> {
        let (tx, rx) = mpsc::channel();
        let topics = topics.iter().map(|t| t.to_string()).collect();

        self.state
            .lock()
            .map_err(|_| InMemoryBrokerError::Poisoned)?
            .subscribers
            .push((topics, tx));

        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn assigns_sequential_offsets_per_topic() {
        let broker = InMemoryBroker::new();
        let sub = broker.subscribe(&["a"]).unwrap();

        broker.publish("a", b"one").unwrap();
        broker.publish("b", b"other").unwrap();
        broker.publish("a", b"two").unwrap();

        let first = sub.recv_timeout(Duration::from_millis(100)).unwrap();
        let second = sub.recv_timeout(Duration::from_millis(100)).unwrap();

        assert_eq!((first.offset, first.payload.as_slice()), (0, &b"one"[..]));
        assert_eq!((second.offset, second.payload.as_slice()), (1, &b"two"[..]));
        assert!(sub.try_recv().is_err());
        assert_eq!(broker.published_count(), 3);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let broker = InMemoryBroker::new();
        drop(broker.subscribe(&["a"]).unwrap());

        broker.publish("a", b"x").unwrap();

        assert_eq!(broker.state.lock().unwrap().subscribers.len(), 0);
        assert_eq!(broker.messages("a"), vec![b"x".to_vec()]);
    }
}
