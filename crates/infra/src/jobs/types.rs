//! Core job types and policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::JobId;

/// How the delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_delay` every time
    Fixed,
    /// `attempt × base_delay`
    #[default]
    Linear,
    /// `base_delay × 2^(attempt-1)`
    Exponential,
}

/// Backoff applied between attempts of one job, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per job, including the first one (1 = no retries)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff with the given attempt budget.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match (self.strategy, attempt) {
            (_, 0) => Duration::ZERO,
            (BackoffStrategy::Fixed, _) => self.base_delay,
            (BackoffStrategy::Linear, n) => self.base_delay.saturating_mul(n),
            (BackoffStrategy::Exponential, n) => {
                self.base_delay.saturating_mul(2u32.saturating_pow(n - 1))
            }
        };
        delay.min(self.max_delay)
    }
}

/// A unit of retryable work submitted to a worker pool.
///
/// Attempts are counted from 1: a freshly created job is on its first
/// attempt. The pool calls [`Job::next_attempt`] before every retry and stops
/// once [`Job::is_exhausted`] holds, so `retry_count` never exceeds
/// `max_retries`.
pub trait Job: Send + 'static {
    fn id(&self) -> JobId;

    /// Current attempt number (1-indexed).
    fn retry_count(&self) -> u32;

    fn max_retries(&self) -> u32;

    /// Advance to the next attempt.
    fn next_attempt(&mut self);

    fn is_exhausted(&self) -> bool {
        self.retry_count() >= self.max_retries()
    }
}

/// Attempt bookkeeping embedded in concrete jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempts {
    current: u32,
    max: u32,
}

impl Attempts {
    /// Start at attempt 1. A budget of 0 is treated as 1.
    pub fn new(max: u32) -> Self {
        Self {
            current: 1,
            max: max.max(1),
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1).min(self.max);
    }
}
