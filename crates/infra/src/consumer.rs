//! Inbound side of the pipeline: broker messages → registered handlers.

use std::collections::HashMap;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use courier_core::{Context, FailedEventId, JobId};
use courier_events::{BrokerMessage, EnvelopeError, EventEnvelope, Subscription};

use crate::dlq::{
    envelope_metadata, metadata_keys, DeadLetterQueue, DlqError, DlqStats, FailedEvent,
    RetryHandler,
};
use crate::jobs::{
    Attempts, Job, JobHandler, PoolConfig, PoolMetrics, RetryPolicy, SpawnError, SubmitError,
    Submitted, WorkerId, WorkerPool,
};

/// Value of the `source` metadata key on entries dead-lettered here.
pub const CONSUMER_SOURCE: &str = "consumer";

/// How often `run_subscription` re-checks its context while idle.
const SUBSCRIPTION_TICK: Duration = Duration::from_millis(100);

/// A registered event handler.
pub type EventHandlerFn = Arc<dyn Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync>;

/// Event-type → handler routing.
///
/// Patterns are an exact event type, a `"prefix.*"` category, or the `"*"`
/// wildcard. Lookup tries them in that order; among categories the longest
/// matching prefix wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, EventHandlerFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `pattern`.
    pub fn register(&self, pattern: impl Into<String>, handler: EventHandlerFn) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern.into(), handler);
    }

    pub fn resolve(&self, event_type: &str) -> Option<EventHandlerFn> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(handler) = handlers.get(event_type) {
            return Some(handler.clone());
        }

        let category = handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = event_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler.clone());
        if category.is_some() {
            return category;
        }

        handlers.get("*").cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub workers: usize,
    pub queue_size: usize,
    /// Attempts per message, including the first
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 1000,
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl ConsumerConfig {
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

    fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_name("consumer")
            .with_workers(self.workers)
            .with_queue_capacity(self.queue_size)
            .with_retry(RetryPolicy::new(self.max_retries, self.base_delay))
    }
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    /// Not retried and not dead-lettered.
    #[error("no handler registered for event type '{event_type}'")]
    NoHandler { event_type: String },

    #[error("handler for '{event_type}' failed: {message}")]
    Handler { event_type: String, message: String },
}

/// Why a broker message was not accepted by [`EventConsumer::handle_message`].
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Decode(#[from] EnvelopeError),

    #[error(transparent)]
    Submit(#[from] SubmitError<ConsumeError>),
}

/// A decoded broker message awaiting dispatch.
#[derive(Debug, Clone)]
pub struct ConsumeJob {
    pub id: JobId,
    pub envelope: EventEnvelope,
    pub payload: Vec<u8>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub correlation_key: Option<String>,
    attempts: Attempts,
}

impl ConsumeJob {
    pub fn new(envelope: EventEnvelope, message: BrokerMessage, max_retries: u32) -> Self {
        Self {
            id: JobId::new(),
            correlation_key: envelope.correlation_key(),
            envelope,
            payload: message.payload,
            topic: message.topic,
            partition: message.partition,
            offset: message.offset,
            key: message.key,
            attempts: Attempts::new(max_retries),
        }
    }
}

impl Job for ConsumeJob {
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

fn dispatch(registry: &HandlerRegistry, envelope: &EventEnvelope) -> Result<(), ConsumeError> {
    let handler = registry
        .resolve(&envelope.event_type)
        .ok_or_else(|| ConsumeError::NoHandler {
            event_type: envelope.event_type.clone(),
        })?;

    handler(envelope).map_err(|e| ConsumeError::Handler {
        event_type: envelope.event_type.clone(),
        message: format!("{e:#}"),
    })
}

/// Worker-side execution of [`ConsumeJob`]s.
pub struct ConsumeHandler {
    registry: Arc<HandlerRegistry>,
    dlq: Arc<DeadLetterQueue>,
}

impl ConsumeHandler {
    fn dead_letter(&self, worker: WorkerId, job: &ConsumeJob, error: String) {
        let mut metadata = envelope_metadata(&job.envelope);
        metadata.insert(metadata_keys::SOURCE.into(), CONSUMER_SOURCE.into());
        metadata.insert(metadata_keys::WORKER_ID.into(), worker.to_string());
        metadata.insert(metadata_keys::ATTEMPTS.into(), job.retry_count().to_string());
        if let Some(key) = &job.correlation_key {
            metadata.insert(metadata_keys::CORRELATION_KEY.into(), key.clone());
        }

        let stored = self.dlq.add_broker_event(
            &job.envelope.event_type,
            job.envelope.data_map(),
            error,
            &job.topic,
            job.partition,
            job.offset,
            metadata,
        );

        match stored {
            Ok(id) => info!(
                failed_event_id = %id,
                event_type = %job.envelope.event_type,
                topic = %job.topic,
                offset = job.offset,
                "message dead-lettered after handler failure"
            ),
            Err(e) => error!(
                event_type = %job.envelope.event_type,
                topic = %job.topic,
                offset = job.offset,
                error = %e,
                "failed to dead-letter message; dropping it"
            ),
        }
    }
}

impl JobHandler<ConsumeJob> for ConsumeHandler {
    type Error = ConsumeError;

    fn handle(&self, _worker: WorkerId, job: &ConsumeJob) -> Result<(), ConsumeError> {
        dispatch(&self.registry, &job.envelope)
    }

    fn on_error(&self, worker: WorkerId, job: &ConsumeJob, err: &ConsumeError) {
        if let ConsumeError::NoHandler { event_type } = err {
            warn!(
                %event_type,
                topic = %job.topic,
                partition = job.partition,
                offset = job.offset,
                "no handler registered; message skipped"
            );
            return;
        }
        self.dead_letter(worker, job, err.to_string());
    }

    fn on_panic(&self, worker: WorkerId, job: &ConsumeJob, message: &str) {
        self.dead_letter(worker, job, format!("handler panicked: {message}"));
    }

    fn is_retryable(&self, err: &ConsumeError) -> bool {
        !matches!(err, ConsumeError::NoHandler { .. })
    }
}

/// DLQ retry handler that re-dispatches the stored envelope locally.
struct LocalReplay {
    registry: Arc<HandlerRegistry>,
}

impl RetryHandler for LocalReplay {
    fn retry(&self, event: &FailedEvent) -> anyhow::Result<()> {
        dispatch(&self.registry, &event.to_envelope())?;
        Ok(())
    }
}

/// Processes broker messages on a worker pool.
///
/// Handler failures are retried with linear backoff and dead-lettered once
/// their attempts run out. Unregistered event types are skipped.
pub struct EventConsumer {
    pool: WorkerPool<ConsumeJob, ConsumeHandler>,
    registry: Arc<HandlerRegistry>,
    max_retries: u32,
    dlq: Arc<DeadLetterQueue>,
}

impl EventConsumer {
    /// Start the consumer's workers.
    ///
    /// Installs a local replay handler on `dlq` unless one is present.
    pub fn new(config: ConsumerConfig, dlq: Arc<DeadLetterQueue>) -> Result<Self, SpawnError> {
        let registry = Arc::new(HandlerRegistry::new());

        if dlq.set_retry_handler_if_absent(Arc::new(LocalReplay {
            registry: registry.clone(),
        })) {
            info!("consumer installed local replay as dlq retry handler");
        }

        let handler = ConsumeHandler {
            registry: registry.clone(),
            dlq: dlq.clone(),
        };
        let pool = WorkerPool::start(config.pool_config(), handler)?;

        Ok(Self {
            pool,
            registry,
            max_retries: config.max_retries,
            dlq,
        })
    }

    /// Route `pattern` (exact type, `"prefix.*"`, or `"*"`) to `handler`.
    pub fn register_handler<F>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        debug!(%pattern, "event handler registered");
        self.registry.register(pattern, Arc::new(handler));
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Decode `message` and submit it for processing.
    ///
    /// Malformed payloads are rejected here and never queued.
    pub fn handle_message(
        &self,
        ctx: &Context,
        message: BrokerMessage,
    ) -> Result<Submitted, ReceiveError> {
        let envelope = match EventEnvelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "discarding undecodable message"
                );
                return Err(e.into());
            }
        };

        let job = ConsumeJob::new(envelope, message, self.max_retries);
        Ok(self.pool.submit(ctx, job)?)
    }

    /// Feed `subscription` into [`handle_message`](Self::handle_message) until
    /// it disconnects or `ctx` is done. Returns the number of accepted messages.
    pub fn run_subscription(
        &self,
        ctx: &Context,
        subscription: &Subscription<BrokerMessage>,
    ) -> u64 {
        let mut accepted = 0;

        while !ctx.is_done() {
            match subscription.recv_timeout(SUBSCRIPTION_TICK) {
                Ok(message) => match self.handle_message(ctx, message) {
                    Ok(_) => accepted += 1,
                    Err(ReceiveError::Submit(SubmitError::Stopped)) => break,
                    Err(ReceiveError::Submit(SubmitError::Context(_))) => break,
                    Err(e) => debug!(error = %e, "message not accepted"),
                },
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("subscription closed");
                    break;
                }
            }
        }

        accepted
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

    /// Stop the workers; queued messages are abandoned.
    pub fn stop(&self) {
        self.pool.stop();
    }
}
