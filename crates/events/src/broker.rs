//! Message broker abstraction (mechanics only).
//!
//! The pipeline depends on a broker through this narrow seam: publish raw
//! bytes to a topic, and subscribe to a set of topics receiving raw bytes plus
//! their coordinates (topic/partition/offset). The wire protocol below this
//! line is the broker client's business.
//!
//! Delivery is **at-least-once**: consumers may see the same message twice
//! and must be idempotent. There is no ordering guarantee across partitions.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A raw message received from a broker, with its coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Broker-native message key or identifier, when the broker has one.
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A subscription to one or more broker topics.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = broker.subscribe(&["user-events"])?;
///
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(message) => consumer.handle_message(&ctx, message)?,
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,  // Broker closed
///     }
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption; fan work out
/// through the consumer's worker pool rather than sharing the subscription.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Broker client seam.
///
/// Implementations must be `Send + Sync`: the publisher calls `publish` from
/// many worker threads concurrently.
pub trait Broker: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish raw bytes to a topic.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), Self::Error>;

    /// Subscribe to the given topics.
    fn subscribe(&self, topics: &[&str]) -> Result<Subscription<BrokerMessage>, Self::Error>;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), Self::Error> {
        (**self).publish(topic, payload)
    }

    fn subscribe(&self, topics: &[&str]) -> Result<Subscription<BrokerMessage>, Self::Error> {
        (**self).subscribe(topics)
    }
}
