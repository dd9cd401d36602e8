//! Periodic operational stats.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use courier_core::Context;
use courier_events::Broker;
use courier_infra::dlq::DlqStats;
use courier_infra::resilience::CircuitBreakerStats;
use courier_infra::{EventConsumer, EventPublisher, PoolMetrics};

const TICK: Duration = Duration::from_millis(100);

/// Point-in-time view of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub publisher: PoolMetrics,
    pub consumer: PoolMetrics,
    pub publisher_queue: usize,
    pub consumer_queue: usize,
    pub dlq: DlqStats,
    pub circuit_breaker: Option<CircuitBreakerStats>,
}

impl PipelineSnapshot {
    pub fn capture<B: Broker + 'static>(
        publisher: &EventPublisher<B>,
        consumer: &EventConsumer,
    ) -> Self {
        Self {
            publisher: publisher.metrics(),
            consumer: consumer.metrics(),
            publisher_queue: publisher.queue_len(),
            consumer_queue: consumer.queue_len(),
            dlq: publisher.dlq_stats(),
            circuit_breaker: publisher.circuit_breaker_stats(),
        }
    }
}

/// Log a [`PipelineSnapshot`] every `interval` until `ctx` is done.
pub fn spawn_stats_reporter<B: Broker + 'static>(
    ctx: Context,
    interval: Duration,
    publisher: Arc<EventPublisher<B>>,
    consumer: Arc<EventConsumer>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("courier-stats".to_string())
        .spawn(move || {
            let mut next = Instant::now() + interval;
            while !ctx.is_done() {
                thread::sleep(TICK.min(interval));
                if Instant::now() < next {
                    continue;
                }
                next += interval;

                let snapshot = PipelineSnapshot::capture(&publisher, &consumer);
                match serde_json::to_string(&snapshot) {
                    Ok(stats) => info!(
                        published = snapshot.publisher.processed,
                        publish_failed = snapshot.publisher.failed,
                        consumed = snapshot.consumer.processed,
                        consume_failed = snapshot.consumer.failed,
                        dead_lettered = snapshot.dlq.total,
                        %stats,
                        "pipeline stats"
                    ),
                    Err(e) => warn!(error = %e, "failed to serialize pipeline stats"),
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_events::InMemoryBroker;
    use courier_infra::{ConsumerConfig, DeadLetterQueue, PublisherConfig};

    fn pipeline() -> (Arc<EventPublisher<InMemoryBroker>>, Arc<EventConsumer>) {
        let dlq = Arc::new(DeadLetterQueue::default());
        let publisher = EventPublisher::new(
            PublisherConfig::default().with_workers(1),
            Arc::new(InMemoryBroker::new()),
            dlq.clone(),
        )
        .unwrap();
        let consumer = EventConsumer::new(ConsumerConfig::default().with_workers(1), dlq).unwrap();
        (Arc::new(publisher), Arc::new(consumer))
    }

    #[test]
    fn snapshot_serializes_every_section() {
        let (publisher, consumer) = pipeline();
        let value = serde_json::to_value(PipelineSnapshot::capture(&publisher, &consumer)).unwrap();

        assert_eq!(value["publisher"]["processed"], 0);
        assert_eq!(value["dlq"]["total"], 0);
        assert_eq!(value["circuit_breaker"]["state"], "closed");
    }

    #[test]
    fn reporter_exits_when_context_is_cancelled() {
        let (publisher, consumer) = pipeline();
        let ctx = Context::background();
        let interval = Duration::from_millis(10);
        let handle = spawn_stats_reporter(ctx.clone(), interval, publisher, consumer).unwrap();

        thread::sleep(Duration::from_millis(50));
        ctx.cancel();
        handle.join().unwrap();
    }
}
