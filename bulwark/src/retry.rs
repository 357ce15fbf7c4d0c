//! Backoff and jitter strategies for the retry controller.
//!
//! The retry loop itself lives in the pipeline composer; this module owns
//! the delay arithmetic and the per-call retry bookkeeping.

use crate::policy::PolicyConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Per-call retry bookkeeping: how many retries were spent and what the
/// next delay is.
///
/// Exclusively owned by one call; attempts within a call are strictly
/// sequential so no synchronization is needed.
#[derive(Debug, Default)]
pub struct RetrySchedule {
    /// Number of retries consumed so far.
    retries_spent: u32,
    /// Previous delay, for decorrelated jitter.
    prev_delay_ms: Option<u64>,
}

impl RetrySchedule {
    /// Creates a fresh schedule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of retries consumed so far.
    #[must_use]
    pub fn retries_spent(&self) -> u32 {
        self.retries_spent
    }

    /// Returns true if the retry budget is exhausted.
    #[must_use]
    pub fn exhausted(&self, config: &PolicyConfig) -> bool {
        self.retries_spent >= config.max_retries
    }

    /// Consumes one retry and returns the delay to sleep before it.
    ///
    /// The delay for the n-th retry (0-indexed) follows the configured
    /// backoff strategy, capped at `max_backoff_ms`, with jitter applied.
    pub fn next_delay(&mut self, config: &PolicyConfig) -> Duration {
        let base = config.backoff_base_ms;
        let max = config.max_backoff_ms;
        let attempt = self.retries_spent;
        self.retries_spent += 1;

        let delay = match config.backoff {
            BackoffStrategy::Exponential => base
                .saturating_mul(2u64.saturating_pow(attempt))
                .min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.prev_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let new_delay = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.prev_delay_ms = Some(new_delay);
                new_delay
            }
        };

        Duration::from_millis(jittered)
    }
}
