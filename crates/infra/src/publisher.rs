//! Outbound side of the pipeline: domain events → broker topics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use courier_core::{Context, FailedEventId, JobId};
use courier_events::{Broker, EnvelopeError, Event, TopicMap};

use crate::dlq::{
    envelope_metadata, metadata_keys, DeadLetterQueue, DlqError, DlqStats, FailedEvent,
    RetryHandler,
};
use crate::jobs::{
    Attempts, Job, JobHandler, PoolConfig, PoolMetrics, RetryPolicy, SpawnError, SubmitError,
    Submitted, WorkerId, WorkerPool,
};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats,
};

/// Value of the `source` metadata key on entries dead-lettered here.
pub const PUBLISHER_SOURCE: &str = "publisher";

/// Coordinates recorded for publish failures, which never reached a broker log.
pub const UNASSIGNED_PARTITION: i32 = -1;
pub const UNASSIGNED_OFFSET: i64 = -1;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub workers: usize,
    pub queue_size: usize,
    /// Attempts per event, including the first
    pub max_retries: u32,
    /// Linear backoff step between attempts
    pub base_delay: Duration,
    pub topics: TopicMap,
    /// `None` disables the breaker
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 1000,
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            topics: TopicMap::new(),
            circuit_breaker: Some(CircuitBreakerConfig::default().with_name("broker-publish")),
        }
    }
}

impl PublisherConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_topics(mut self, topics: TopicMap) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_circuit_breaker(mut self, config: Option<CircuitBreakerConfig>) -> Self {
        self.circuit_breaker = config;
        self
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_name("publisher")
            .with_workers(self.workers)
            .with_queue_capacity(self.queue_size)
            .with_retry(RetryPolicy::new(self.max_retries, self.base_delay))
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    /// Not retried: the same event will never encode.
    #[error(transparent)]
    Encode(#[from] EnvelopeError),

    #[error("broker rejected publish to '{topic}': {message}")]
    Broker { topic: String, message: String },

    /// Not retried: backoff would only hold the worker while the breaker is open.
    #[error("circuit breaker '{breaker}' is open")]
    CircuitOpen { breaker: String },
}

/// One event on its way to one topic.
#[derive(Debug, Clone)]
pub struct PublishJob {
    pub id: JobId,
    pub event: Event,
    pub topic: String,
    attempts: Attempts,
}

impl PublishJob {
    pub fn new(event: Event, topic: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: JobId::new(),
            event,
            topic: topic.into(),
            attempts: Attempts::new(max_retries),
        }
    }
}

impl Job for PublishJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn retry_count(&self) -> u32 {
        self.attempts.current()
    }

    fn max_retries(&self) -> u32 {
        self.attempts.max()
    }

    fn next_attempt(&mut self) {
        self.attempts.advance();
    }
}

/// Broker access shared by the workers and the DLQ replay path.
struct Delivery<B> {
    broker: Arc<B>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl<B> Clone for Delivery<B> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            breaker: self.breaker.clone(),
        }
    }
}

impl<B: Broker> Delivery<B> {
    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let broker_error = |e: B::Error| PublishError::Broker {
            topic: topic.to_string(),
            message: e.to_string(),
        };

        match &self.breaker {
            Some(breaker) => breaker
                .execute(|| self.broker.publish(topic, payload))
                .map_err(|e| match e {
                    CircuitBreakerError::Open { name } => {
                        PublishError::CircuitOpen { breaker: name }
                    }
                    CircuitBreakerError::Inner(e) => broker_error(e),
                }),
            None => self.broker.publish(topic, payload).map_err(broker_error),
        }
    }
}

/// Worker-side execution of [`PublishJob`]s.
pub struct PublishHandler<B> {
    delivery: Delivery<B>,
    dlq: Arc<DeadLetterQueue>,
}

impl<B: Broker> PublishHandler<B> {
    fn dead_letter(&self, worker: WorkerId, job: &PublishJob, error: String) {
        let envelope = job.event.to_envelope();

        let mut metadata: HashMap<String, String> = job.event.metadata.clone();
        metadata.extend(envelope_metadata(&envelope));
        metadata.insert(metadata_keys::SOURCE.into(), PUBLISHER_SOURCE.into());
        metadata.insert(metadata_keys::WORKER_ID.into(), worker.to_string());
        metadata.insert(metadata_keys::EVENT_ID.into(), job.event.id.to_string());
        metadata.insert(metadata_keys::ATTEMPTS.into(), job.retry_count().to_string());
        if let Some(aggregate_id) = &job.event.aggregate_id {
            metadata.insert(metadata_keys::AGGREGATE_ID.into(), aggregate_id.clone());
        }

        let stored = self.dlq.add_broker_event(
            &job.event.event_type,
            envelope.data_map(),
            error,
            &job.topic,
            UNASSIGNED_PARTITION,
            UNASSIGNED_OFFSET,
            metadata,
        );

        match stored {
            Ok(id) => info!(
                failed_event_id = %id,
                event_id = %job.event.id,
                event_type = %job.event.event_type,
                topic = %job.topic,
                "event dead-lettered after publish failure"
            ),
            Err(e) => error!(
                event_id = %job.event.id,
                event_type = %job.event.event_type,
                topic = %job.topic,
                error = %e,
                "failed to dead-letter event; dropping it"
            ),
        }
    }
}

impl<B: Broker + 'static> JobHandler<PublishJob> for PublishHandler<B> {
    type Error = PublishError;

    fn handle(&self, _worker: WorkerId, job: &PublishJob) -> Result<(), PublishError> {
        let payload = job.event.to_envelope().encode()?;
        self.delivery.send(&job.topic, &payload)
    }

    fn on_error(&self, worker: WorkerId, job: &PublishJob, err: &PublishError) {
        self.dead_letter(worker, job, err.to_string());
    }

    fn on_panic(&self, worker: WorkerId, job: &PublishJob, message: &str) {
        self.dead_letter(worker, job, format!("publish panicked: {message}"));
    }

    fn is_retryable(&self, err: &PublishError) -> bool {
        !matches!(err, PublishError::Encode(_) | PublishError::CircuitOpen { .. })
    }
}

/// DLQ retry handler that republishes the stored envelope.
struct BrokerReplay<B> {
    delivery: Delivery<B>,
}

impl<B: Broker + 'static> RetryHandler for BrokerReplay<B> {
    fn retry(&self, event: &FailedEvent) -> anyhow::Result<()> {
        let topic = event.topic.as_deref().unwrap_or(&event.event_type);
        let payload = event.to_envelope().encode()?;
        self.delivery.send(topic, &payload)?;
        Ok(())
    }
}

/// Asynchronously publishes domain events through a worker pool.
///
/// Failed publishes are retried with linear backoff, guarded by a circuit
/// breaker, and dead-lettered once their attempts run out.
pub struct EventPublisher<B: Broker + 'static> {
    pool: WorkerPool<PublishJob, PublishHandler<B>>,
    topics: TopicMap,
    max_retries: u32,
    dlq: Arc<DeadLetterQueue>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl<B: Broker + 'static> EventPublisher<B> {
    /// Start the publisher's workers.
    ///
    /// Installs a broker replay handler on `dlq` unless one is present.
    pub fn new(
        config: PublisherConfig,
        broker: Arc<B>,
        dlq: Arc<DeadLetterQueue>,
    ) -> Result<Self, SpawnError> {
        let breaker = config
            .circuit_breaker
            .clone()
            .map(|cb| Arc::new(CircuitBreaker::new(cb)));
        let delivery = Delivery { broker, breaker: breaker.clone() };

        if dlq.set_retry_handler_if_absent(Arc::new(BrokerReplay { delivery: delivery.clone() })) {
            info!("publisher installed broker replay as dlq retry handler");
        }

        let handler = PublishHandler { delivery, dlq: dlq.clone() };
        let pool = WorkerPool::start(config.pool_config(), handler)?;

        Ok(Self {
            pool,
            topics: config.topics,
            max_retries: config.max_retries,
            dlq,
            breaker,
        })
    }

    /// Hand `event` to the pool.
    ///
    /// `Submitted::Queued` means a worker will deliver it later. When the
    /// queue is full the event is delivered on this thread before returning,
    /// and a terminal failure (an open circuit, for example) comes back as
    /// `SubmitError::Inline` after the event has been dead-lettered.
    pub fn publish_event(
        &self,
        ctx: &Context,
        event: Event,
    ) -> Result<Submitted, SubmitError<PublishError>> {
        let topic = self.topics.resolve(&event.event_type).to_string();
        self.pool.submit(ctx, PublishJob::new(event, topic, self.max_retries))
    }

    pub fn topic_for<'a>(&'a self, event_type: &'a str) -> &'a str {
        self.topics.resolve(event_type)
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    pub fn queue_len(&self) -> usize {
        self.pool.queue_len()
    }

    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn dlq_stats(&self) -> DlqStats {
        self.dlq.stats()
    }

    pub fn list_failed_events(&self, limit: usize, offset: usize) -> Vec<FailedEvent> {
        self.dlq.list_events(limit, offset)
    }

    pub fn get_failed_event(&self, id: FailedEventId) -> Result<FailedEvent, DlqError> {
        self.dlq.get_event(id)
    }

    pub fn retry_failed_event(&self, id: FailedEventId) -> Result<(), DlqError> {
        self.dlq.retry_event(id)
    }

    pub fn delete_failed_event(&self, id: FailedEventId) -> Result<(), DlqError> {
        self.dlq.delete_event(id)
    }

    /// `None` when the breaker is disabled.
    pub fn circuit_breaker_stats(&self) -> Option<CircuitBreakerStats> {
        self.breaker.as_ref().map(|cb| cb.stats())
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Stop the workers; queued events are abandoned.
    pub fn stop(&self) {
        self.pool.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_events::{BrokerMessage, EventEnvelope, InMemoryBroker, Subscription};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config() -> PublisherConfig {
        PublisherConfig::default()
            .with_workers(1)
            .with_queue_size(16)
            .with_base_delay(Duration::from_millis(1))
            .with_topics(TopicMap::new().with_route("user.created", "user-events"))
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !cond() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn publishes_envelope_to_mapped_topic() {
        let broker = Arc::new(InMemoryBroker::new());
        let dlq = Arc::new(DeadLetterQueue::default());
        let publisher = EventPublisher::new(config(), broker.clone(), dlq).unwrap();

        let event = Event::new("user.created", json!({"id": "u-1"})).with_version(2);
        publisher.publish_event(&Context::background(), event).unwrap();

        wait_for(|| broker.messages("user-events").len() == 1);
        let envelope = EventEnvelope::decode(&broker.messages("user-events")[0]).unwrap();
        assert_eq!(envelope.event_type, "user.created");
        assert_eq!(envelope.version, 2);
        assert_eq!(envelope.data["id"], "u-1");
    }

    #[test]
    fn unmapped_types_publish_to_their_own_name() {
        let broker = Arc::new(InMemoryBroker::new());
        let dlq = Arc::new(DeadLetterQueue::default());
        let publisher = EventPublisher::new(config(), broker.clone(), dlq).unwrap();

        assert_eq!(publisher.topic_for("order.placed"), "order.placed");
        publisher
            .publish_event(&Context::background(), Event::new("order.placed", json!({})))
            .unwrap();

        wait_for(|| broker.published_count() == 1);
        assert_eq!(broker.messages("order.placed").len(), 1);
    }

    #[test]
    fn installs_replay_handler_only_when_absent() {
        let broker = Arc::new(InMemoryBroker::new());
        let dlq = Arc::new(DeadLetterQueue::default());
        assert!(!dlq.has_retry_handler());

        let _publisher = EventPublisher::new(config(), broker, dlq.clone()).unwrap();

        assert!(dlq.has_retry_handler());
    }

    #[test]
    fn replay_republishes_dead_lettered_envelope() {
        let broker = Arc::new(InMemoryBroker::new());
        let dlq = Arc::new(DeadLetterQueue::default());
        let publisher = EventPublisher::new(config(), broker.clone(), dlq.clone()).unwrap();

        let envelope = EventEnvelope::new("user.created", json!({"id": "u-9"}));
        let id = dlq
            .add_broker_event(
                "user.created",
                envelope.data_map(),
                "broker down",
                "user-events",
                -1,
                -1,
                envelope_metadata(&envelope),
            )
            .unwrap();

        publisher.retry_failed_event(id).unwrap();

        assert!(matches!(publisher.get_failed_event(id), Err(DlqError::NotFound(_))));
        let replayed = EventEnvelope::decode(&broker.messages("user-events")[0]).unwrap();
        assert_eq!(replayed, envelope);
    }

    #[test]
    fn open_circuit_dead_letters_without_backoff() {
        let broker = Arc::new(InMemoryBroker::new());
        let dlq = Arc::new(DeadLetterQueue::default());
        let publisher = EventPublisher::new(
            config().with_max_retries(5).with_base_delay(Duration::from_secs(10)),
            broker.clone(),
            dlq.clone(),
        )
        .unwrap();
        publisher.circuit_breaker().unwrap().force_open();

        let started = std::time::Instant::now();
        let outcome = publisher
            .publish_event(&Context::background(), Event::new("user.created", json!({"id": "u-2"})))
            .unwrap();
        assert_eq!(outcome, Submitted::Queued);

        wait_for(|| dlq.len() == 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        let metrics = publisher.metrics();
        assert_eq!((metrics.failed, metrics.retried), (1, 0));
        assert!(dlq.list_events(1, 0)[0].error.contains("is open"));
        assert_eq!(broker.published_count(), 0);
    }

    #[test]
    fn broker_panic_is_dead_lettered_and_worker_survives() {
        #[derive(Debug, Error)]
        #[error("unreachable")]
        struct Never;

        /// Panics on the first publish, then delegates.
        struct PanicsOnce {
            panicked: AtomicBool,
            inner: InMemoryBroker,
        }

        impl Broker for PanicsOnce {
            type Error = Never;

            fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), Never> {
                if !self.panicked.swap(true, Ordering::SeqCst) {
                    panic!("connection state corrupted");
                }
                self.inner.publish(topic, payload).map_err(|_| Never)
            }

            fn subscribe(&self, topics: &[&str]) -> Result<Subscription<BrokerMessage>, Never> {
                self.inner.subscribe(topics).map_err(|_| Never)
            }
        }

        let broker = Arc::new(PanicsOnce {
            panicked: AtomicBool::new(false),
            inner: InMemoryBroker::new(),
        });
        let dlq = Arc::new(DeadLetterQueue::default());
        let publisher = EventPublisher::new(config(), broker.clone(), dlq.clone()).unwrap();
        let ctx = Context::background();

        publisher
            .publish_event(&ctx, Event::new("user.created", json!({"id": "u-3"})))
            .unwrap();
        publisher
            .publish_event(&ctx, Event::new("user.created", json!({"id": "u-4"})))
            .unwrap();

        wait_for(|| publisher.metrics().processed == 1);
        assert_eq!(publisher.metrics().failed, 1);
        let entries = dlq.list_events(10, 0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_data["id"], "u-3");
        assert!(entries[0].error.contains("connection state corrupted"));
        assert_eq!(broker.inner.messages("user-events").len(), 1);
    }

    #[test]
    fn breaker_stats_absent_when_disabled() {
        let publisher = EventPublisher::new(
            config().with_circuit_breaker(None),
            Arc::new(InMemoryBroker::new()),
            Arc::new(DeadLetterQueue::default()),
        )
        .unwrap();

        assert!(publisher.circuit_breaker_stats().is_none());
    }
}
