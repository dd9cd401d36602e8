use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::{info, warn};

use courier_core::Context;
use courier_events::{Broker, EventEnvelope};
use courier_infra::broker::{RedisStreamsBroker, RedisStreamsConfig};
use courier_infra::dlq::PostgresDlqStorage;
use courier_infra::{DeadLetterQueue, EventConsumer, EventPublisher, PipelineConfig};
use courier_relay::{Forwarder, PipelineSnapshot, spawn_stats_reporter};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("courier-rt")
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let dlq = Arc::new(match &config.database_url {
        Some(url) => {
            let storage = PostgresDlqStorage::connect(url, runtime.handle().clone())
                .context("failed to connect DLQ storage")?;
            info!("dead-letter queue backed by postgres");
            DeadLetterQueue::with_storage(config.dlq.clone(), Arc::new(storage))
        }
        None => {
            warn!("DATABASE_URL not set; dead-letter queue is in-memory only");
            DeadLetterQueue::new(config.dlq.clone())
        }
    });

    let broker = Arc::new(
        RedisStreamsBroker::new(
            &config.redis_url,
            RedisStreamsConfig::default().with_group(config.consumer_group.clone()),
        )
        .context("invalid REDIS_URL")?,
    );

    let publisher = Arc::new(EventPublisher::new(
        config.publisher.clone(),
        broker.clone(),
        dlq.clone(),
    )?);
    let consumer = Arc::new(EventConsumer::new(config.consumer.clone(), dlq.clone())?);

    let ctx = Context::background();

    let forwarder = Forwarder::new(publisher.clone(), config.consumer_topics.clone(), ctx.clone());
    consumer.register_handler("*", move |envelope: &EventEnvelope| forwarder.forward(envelope));

    {
        let ctx = ctx.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                ctx.cancel();
            }
        });
    }

    let reporter =
        spawn_stats_reporter(ctx.clone(), STATS_INTERVAL, publisher.clone(), consumer.clone())
            .context("failed to start stats reporter")?;

    if config.consumer_topics.is_empty() {
        warn!("no consumer topics configured; publishing only until shutdown");
        while !ctx.is_done() {
            std::thread::sleep(Duration::from_millis(200));
        }
    } else {
        let topics: Vec<&str> = config.consumer_topics.iter().map(String::as_str).collect();
        let subscription = broker.subscribe(&topics).context("failed to subscribe")?;
        info!(topics = ?topics, group = %config.consumer_group, "relay started");

        let accepted = consumer.run_subscription(&ctx, &subscription);
        info!(accepted, "subscription ended");
        ctx.cancel();
    }

    consumer.stop();
    publisher.stop();
    if reporter.join().is_err() {
        warn!("stats reporter panicked");
    }

    let snapshot = PipelineSnapshot::capture(&publisher, &consumer);
    info!(
        published = snapshot.publisher.processed,
        consumed = snapshot.consumer.processed,
        dead_lettered = snapshot.dlq.total,
        "relay stopped"
    );

    Ok(())
}
