//! Immutable per-resource policy configuration.
//!
//! One [`PolicyConfig`] is created at setup time for each protected
//! downstream resource and shared read-only by every call against that
//! resource. Durations are expressed as millisecond fields so configs
//! serialize cleanly.

use crate::errors::PolicyConfigError;
use crate::retry::{BackoffStrategy, JitterStrategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one wrapped resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy name, used to tag events and errors.
    pub name: String,

    /// Wall-clock budget for a single attempt in milliseconds.
    pub attempt_timeout_ms: u64,

    /// Maximum number of operations executing concurrently.
    pub max_parallel: usize,

    /// Maximum number of callers waiting for bulkhead admission.
    pub max_queue: usize,

    /// How long a queued caller waits for admission before rejection,
    /// in milliseconds.
    pub queue_timeout_ms: u64,

    /// Failure ratio at which the circuit opens, in (0.0, 1.0].
    pub failure_ratio: f64,

    /// Minimum samples in the window before the breaker may open.
    pub minimum_throughput: usize,

    /// Rolling sample window duration in milliseconds.
    pub sampling_window_ms: u64,

    /// How long the circuit stays open before probing, in milliseconds.
    pub break_duration_ms: u64,

    /// Maximum retry attempts after the initial attempt.
    pub max_retries: u32,

    /// Base delay between retries in milliseconds.
    pub backoff_base_ms: u64,

    /// Maximum backoff delay cap in milliseconds.
    pub max_backoff_ms: u64,

    /// Backoff strategy.
    pub backoff: BackoffStrategy,

    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            attempt_timeout_ms: 1000,
            max_parallel: 16,
            max_queue: 32,
            queue_timeout_ms: 500,
            failure_ratio: 0.5,
            minimum_throughput: 10,
            sampling_window_ms: 10_000,
            break_duration_ms: 5000,
            max_retries: 3,
            backoff_base_ms: 100,
            max_backoff_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }
}

impl PolicyConfig {
    /// Creates a policy with default values and the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Preset for control-plane operations: tight timeout, low
    /// concurrency, fast rejection.
    #[must_use]
    pub fn control_plane(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attempt_timeout_ms: 250,
            max_parallel: 4,
            max_queue: 4,
            queue_timeout_ms: 100,
            max_retries: 2,
            backoff_base_ms: 50,
            ..Self::default()
        }
    }

    /// Preset for best-effort integrations: long timeout, high
    /// concurrency, generous queueing.
    #[must_use]
    pub fn best_effort(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attempt_timeout_ms: 5000,
            max_parallel: 64,
            max_queue: 128,
            queue_timeout_ms: 2000,
            max_retries: 5,
            backoff_base_ms: 200,
            jitter: JitterStrategy::Full,
            ..Self::default()
        }
    }

    /// Sets the attempt timeout.
    #[must_use]
    pub fn with_attempt_timeout_ms(mut self, ms: u64) -> Self {
        self.attempt_timeout_ms = ms;
        self
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }

    /// Sets the admission queue bound.
    #[must_use]
    pub fn with_max_queue(mut self, max: usize) -> Self {
        self.max_queue = max;
        self
    }

    /// Sets the queue wait timeout.
    #[must_use]
    pub fn with_queue_timeout_ms(mut self, ms: u64) -> Self {
        self.queue_timeout_ms = ms;
        self
    }

    /// Sets the failure ratio threshold.
    #[must_use]
    pub fn with_failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    /// Sets the minimum throughput.
    #[must_use]
    pub fn with_minimum_throughput(mut self, count: usize) -> Self {
        self.minimum_throughput = count;
        self
    }

    /// Sets the sampling window.
    #[must_use]
    pub fn with_sampling_window_ms(mut self, ms: u64) -> Self {
        self.sampling_window_ms = ms;
        self
    }

    /// Sets the break duration.
    #[must_use]
    pub fn with_break_duration_ms(mut self, ms: u64) -> Self {
        self.break_duration_ms = ms;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base backoff delay.
    #[must_use]
    pub fn with_backoff_base_ms(mut self, ms: u64) -> Self {
        self.backoff_base_ms = ms;
        self
    }

    /// Sets the backoff delay cap.
    #[must_use]
    pub fn with_max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), PolicyConfigError> {
        if self.max_parallel < 1 {
            return Err(PolicyConfigError::ZeroParallelism);
        }
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(PolicyConfigError::InvalidFailureRatio(self.failure_ratio));
        }
        if self.sampling_window_ms < 1 {
            return Err(PolicyConfigError::EmptySamplingWindow);
        }
        if self.minimum_throughput < 1 {
            return Err(PolicyConfigError::ZeroThroughput);
        }
        if self.attempt_timeout_ms < 1 {
            return Err(PolicyConfigError::ZeroTimeout);
        }
        if self.break_duration_ms < 1 {
            return Err(PolicyConfigError::ZeroBreakDuration);
        }
        if self.max_backoff_ms < self.backoff_base_ms {
            return Err(PolicyConfigError::BackoffCapBelowBase {
                base: self.backoff_base_ms,
                max: self.max_backoff_ms,
            });
        }
        Ok(())
    }

    /// Returns the attempt timeout as a duration.
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Returns the queue wait timeout as a duration.
    #[must_use]
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    /// Returns the sampling window as a duration.
    #[must_use]
    pub fn sampling_window(&self) -> Duration {
        Duration::from_millis(self.sampling_window_ms)
    }

    /// Returns the break duration as a duration.
    #[must_use]
    pub fn break_duration(&self) -> Duration {
        Duration::from_millis(self.break_duration_ms)
    }
}
