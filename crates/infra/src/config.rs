//! Pipeline configuration loaded from the environment.
//!
//! | variable | default |
//! |---|---|
//! | `COURIER_PUBLISHER_WORKERS` | 4 |
//! | `COURIER_PUBLISHER_QUEUE_SIZE` | 1000 |
//! | `COURIER_PUBLISHER_MAX_RETRIES` | 3 |
//! | `COURIER_PUBLISHER_BASE_DELAY_MS` | 100 |
//! | `COURIER_CONSUMER_WORKERS` | 4 |
//! | `COURIER_CONSUMER_QUEUE_SIZE` | 1000 |
//! | `COURIER_CONSUMER_MAX_RETRIES` | 3 |
//! | `COURIER_CONSUMER_BASE_DELAY_MS` | 100 |
//! | `COURIER_CIRCUIT_BREAKER_ENABLED` | true |
//! | `COURIER_CIRCUIT_FAILURE_THRESHOLD` | 5 |
//! | `COURIER_CIRCUIT_SUCCESS_THRESHOLD` | 2 |
//! | `COURIER_CIRCUIT_TIMEOUT_MS` | 30000 |
//! | `COURIER_DLQ_MAX_SIZE` | 10000 |
//! | `COURIER_DLQ_MAX_ATTEMPTS` | 3 |
//! | `COURIER_TOPICS` | empty (`type=topic,type=topic`) |
//! | `COURIER_CONSUMER_GROUP` | `courier` |
//! | `COURIER_CONSUMER_TOPICS` | topics named in `COURIER_TOPICS` |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `DATABASE_URL` | unset (in-memory DLQ) |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use courier_events::{TopicMap, TopicMapParseError};

use crate::consumer::ConsumerConfig;
use crate::dlq::DlqConfig;
use crate::publisher::PublisherConfig;
use crate::resilience::CircuitBreakerConfig;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_CONSUMER_GROUP: &str = "courier";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    TopicMap(#[from] TopicMapParseError),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
    pub dlq: DlqConfig,
    pub redis_url: String,
    /// Postgres DLQ storage when set
    pub database_url: Option<String>,
    pub consumer_group: String,
    pub consumer_topics: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            publisher: PublisherConfig::default(),
            consumer: ConsumerConfig::default(),
            dlq: DlqConfig::default(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            database_url: None,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_topics: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let topics: TopicMap = match env.get("COURIER_TOPICS") {
            Some(raw) => raw.parse()?,
            None => TopicMap::new(),
        };

        let circuit_breaker = if env.parse_or("COURIER_CIRCUIT_BREAKER_ENABLED", true)? {
            let base = CircuitBreakerConfig::default().with_name("broker-publish");
            Some(
                base.clone()
                    .with_failure_threshold(
                        env.parse_or("COURIER_CIRCUIT_FAILURE_THRESHOLD", base.failure_threshold)?,
                    )
                    .with_success_threshold(
                        env.parse_or("COURIER_CIRCUIT_SUCCESS_THRESHOLD", base.success_threshold)?,
                    )
                    .with_timeout(env.millis_or("COURIER_CIRCUIT_TIMEOUT_MS", base.timeout)?),
            )
        } else {
            None
        };

        let p = &defaults.publisher;
        let publisher = PublisherConfig::default()
            .with_workers(env.parse_or("COURIER_PUBLISHER_WORKERS", p.workers)?)
            .with_queue_size(env.parse_or("COURIER_PUBLISHER_QUEUE_SIZE", p.queue_size)?)
            .with_max_retries(env.parse_or("COURIER_PUBLISHER_MAX_RETRIES", p.max_retries)?)
            .with_base_delay(env.millis_or("COURIER_PUBLISHER_BASE_DELAY_MS", p.base_delay)?)
            .with_topics(topics.clone())
            .with_circuit_breaker(circuit_breaker);

        let c = &defaults.consumer;
        let consumer = ConsumerConfig::default()
            .with_workers(env.parse_or("COURIER_CONSUMER_WORKERS", c.workers)?)
            .with_queue_size(env.parse_or("COURIER_CONSUMER_QUEUE_SIZE", c.queue_size)?)
            .with_max_retries(env.parse_or("COURIER_CONSUMER_MAX_RETRIES", c.max_retries)?)
            .with_base_delay(env.millis_or("COURIER_CONSUMER_BASE_DELAY_MS", c.base_delay)?);

        let dlq = DlqConfig::default()
            .with_max_size(env.parse_or("COURIER_DLQ_MAX_SIZE", defaults.dlq.max_size)?)
            .with_max_attempts(
                env.parse_or("COURIER_DLQ_MAX_ATTEMPTS", defaults.dlq.max_attempts)?,
            );

        let consumer_topics = match env.get("COURIER_CONSUMER_TOPICS") {
            Some(raw) => split_list(&raw),
            None => topics.topics().into_iter().map(str::to_string).collect(),
        };

        Ok(Self {
            publisher,
            consumer,
            dlq,
            redis_url: env.get("REDIS_URL").unwrap_or(defaults.redis_url),
            database_url: env.get("DATABASE_URL"),
            consumer_group: env.get("COURIER_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            consumer_topics,
        })
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    /// Trimmed value; blank counts as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse_or(key, default_ms).map(Duration::from_millis)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
