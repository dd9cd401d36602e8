//! Delivery machinery: worker pool, circuit breaker, dead-letter queue, and
//! the publisher/consumer built on them.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod jobs;
pub mod publisher;
pub mod resilience;


pub use config::{ConfigError, PipelineConfig};
pub use consumer::{ConsumeError, ConsumerConfig, EventConsumer, HandlerRegistry, ReceiveError};
pub use dlq::{DeadLetterQueue, DlqConfig, DlqError, DlqStorage, FailedEvent, RetryHandler};
pub use jobs::{PoolMetrics, SubmitError, Submitted, WorkerPool};
pub use publisher::{EventPublisher, PublishError, PublisherConfig};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
