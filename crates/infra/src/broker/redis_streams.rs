//! Redis Streams-backed [`Broker`] (durable, at-least-once delivery).
//!
//! - **Topic**: one stream per topic, the stream key is the topic name
//! - **Publish**: `XADD <topic> * payload <bytes>`
//! - **Subscribe**: one consumer group per configured group name, read with
//!   `XREADGROUP` from a background polling thread
//! - **Ack**: an entry is acknowledged once it has been handed to the
//!   subscription channel
//!
//! Messages carry partition 0, the millisecond part of the stream entry id as
//! offset, and the full entry id as key.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{Commands, RedisError};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use courier_events::{Broker, BrokerMessage, Subscription};

/// Field holding the encoded envelope in each stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// Pause after a failed read before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RedisStreamsError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),

    #[error("failed to spawn subscription thread: {0}")]
    Spawn(String),
}

impl From<RedisError> for RedisStreamsError {
    fn from(e: RedisError) -> Self {
        if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
            RedisStreamsError::Connection(e.to_string())
        } else {
            RedisStreamsError::Command(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    /// Consumer group shared by every subscriber of this broker
    pub group: String,
    /// Consumer name within the group
    pub consumer: String,
    /// Entries fetched per `XREADGROUP`
    pub batch_size: usize,
    /// How long one `XREADGROUP` blocks waiting for entries
    pub block: Duration,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            group: "courier".to_string(),
            consumer: format!("courier-{}", std::process::id()),
            batch_size: 10,
            block: Duration::from_millis(100),
        }
    }
}

impl RedisStreamsConfig {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    config: RedisStreamsConfig,
}

impl RedisStreamsBroker {
    /// Create a broker for `redis_url` (e.g. `redis://localhost:6379`).
    ///
    /// No connection is made until the first publish or subscribe.
    pub fn new(
        redis_url: impl AsRef<str>,
        config: RedisStreamsConfig,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    pub fn config(&self) -> &RedisStreamsConfig {
        &self.config
    }

    /// Create the consumer group on `topic` if missing (idempotent).
    ///
    /// The stream is created too, and new groups start at the end of it.
    pub fn ensure_consumer_group(&self, topic: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;
        let created: Result<(), RedisError> =
            conn.xgroup_create_mkstream(topic, &self.config.group, "$");

        match created {
            Ok(()) => {
                debug!(%topic, group = %self.config.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }
}

impl Broker for RedisStreamsBroker {
    type Error = RedisStreamsError;

    #[instrument(skip(self, payload), fields(bytes = payload.len()), err)]
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), Self::Error> {
        let mut conn = self.connection()?;
        let _: String = conn.xadd(topic, "*", &[(PAYLOAD_FIELD, payload)])?;
        Ok(())
    }

    fn subscribe(&self, topics: &[&str]) -> Result<Subscription<BrokerMessage>, Self::Error> {
        for topic in topics {
            self.ensure_consumer_group(topic)?;
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let poller = StreamPoller {
            broker: self.clone(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            sender: tx,
        };

        thread::Builder::new()
            .name(format!("redis-streams-{}", self.config.consumer))
            .spawn(move || poller.run())
            .map_err(|e| RedisStreamsError::Spawn(e.to_string()))?;

        info!(
            topics = ?topics,
            group = %self.config.group,
            consumer = %self.config.consumer,
            "redis streams subscription started"
        );

        Ok(Subscription::new(rx))
    }
}

/// Background reader feeding one subscription. Exits on the first delivery
/// attempted after the receiving side was dropped.
struct StreamPoller {
    broker: RedisStreamsBroker,
    topics: Vec<String>,
    sender: std::sync::mpsc::Sender<BrokerMessage>,
}

impl StreamPoller {
    fn run(self) {
        let mut conn: Option<redis::Connection> = None;

        loop {
            if conn.is_none() {
                match self.broker.connection() {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        warn!(error = %e, "redis unavailable; retrying");
                        thread::sleep(ERROR_BACKOFF);
                        continue;
                    }
                }
            }
            let Some(connection) = conn.as_mut() else {
                continue;
            };

            match self.poll_once(connection) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(error = %e, "failed to read from redis streams");
                    conn = None;
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }

        debug!(consumer = %self.broker.config.consumer, "redis streams poller stopped");
    }

    /// Read one batch. Returns `Ok(false)` once the subscriber is gone.
    fn poll_once(&self, conn: &mut redis::Connection) -> Result<bool, RedisStreamsError> {
        let config = &self.broker.config;
        let opts = StreamReadOptions::default()
            .group(&config.group, &config.consumer)
            .count(config.batch_size)
            .block(config.block.as_millis() as usize);
        let ids = vec![">"; self.topics.len()];

        let reply: Option<StreamReadReply> = conn.xread_options(&self.topics[..], &ids[..], &opts)?;
        let Some(reply) = reply else {
            return Ok(true);
        };

        for stream in reply.keys {
            for entry in stream.ids {
                let Some(message) = to_message(&stream.key, &entry) else {
                    warn!(
                        topic = %stream.key,
                        id = %entry.id,
                        "stream entry without payload; acknowledging"
                    );
                    let _: i64 = conn.xack(&stream.key, &config.group, &[&entry.id])?;
                    continue;
                };

                if self.sender.send(message).is_err() {
                    // Left pending in the group; another consumer can claim it.
                    return Ok(false);
                }
                let _: i64 = conn.xack(&stream.key, &config.group, &[&entry.id])?;
            }
        }

        Ok(true)
    }
}

fn to_message(topic: &str, entry: &StreamId) -> Option<BrokerMessage> {
    let payload: Vec<u8> = entry.get(PAYLOAD_FIELD)?;
    Some(BrokerMessage::new(topic, 0, entry_millis(&entry.id), payload).with_key(entry.id.clone()))
}

/// Millisecond component of a stream entry id (`<ms>-<seq>`).
fn entry_millis(id: &str) -> i64 {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse().ok())
        .unwrap_or_default()
}
