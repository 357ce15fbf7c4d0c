//! Error taxonomy for pipeline execution.
//!
//! Every failure that leaves the pipeline is an [`ExecutionFailure`] tagged
//! with a [`FailureKind`], the underlying error, and the call's correlation
//! identifier, so callers can tell a degraded result from a hard failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Boxed error type used for operation and fallback errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Categorizes how a pipeline call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An attempt exceeded its duration budget.
    Timeout,
    /// The bulkhead had no capacity and the call was not admitted.
    BulkheadRejected,
    /// The circuit breaker rejected the call without invoking the operation.
    CircuitOpen,
    /// Transient failures persisted past the retry budget.
    RetriesExhausted,
    /// The classifier marked the operation's error a permanent failure.
    OperationError,
    /// The caller cancelled the call.
    Cancelled,
}

impl FailureKind {
    /// Returns the snake_case name used in event payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::BulkheadRejected => "bulkhead_rejected",
            Self::CircuitOpen => "circuit_open",
            Self::RetriesExhausted => "retries_exhausted",
            Self::OperationError => "operation_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified failure returned from [`execute`](crate::pipeline::ResiliencePipeline::execute).
///
/// Carries enough detail to distinguish which layer failed and to correlate
/// the failure with emitted events.
#[derive(Debug, Error)]
#[error("{kind} in policy '{policy}' after {attempts} attempt(s) [{correlation_id}]: {error}")]
pub struct ExecutionFailure {
    /// The failure category.
    pub kind: FailureKind,
    /// The policy the call executed under.
    pub policy: String,
    /// The correlation identifier of the failed call.
    pub correlation_id: Uuid,
    /// Number of attempts made before the failure surfaced.
    pub attempts: u32,
    /// The underlying error.
    pub error: BoxError,
}

impl ExecutionFailure {
    /// Creates a new execution failure.
    #[must_use]
    pub fn new(
        kind: FailureKind,
        policy: impl Into<String>,
        correlation_id: Uuid,
        attempts: u32,
        error: BoxError,
    ) -> Self {
        Self {
            kind,
            policy: policy.into(),
            correlation_id,
            attempts,
            error,
        }
    }

    /// Returns true if this failure was caused by caller cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

/// Error raised when an attempt exceeds its duration budget.
#[derive(Debug, Clone, Error)]
#[error("attempt exceeded its {budget_ms}ms budget after {elapsed_ms}ms")]
pub struct TimeoutError {
    /// The configured budget in milliseconds.
    pub budget_ms: u64,
    /// Wall-clock time observed when the deadline fired.
    pub elapsed_ms: u64,
}

/// Error raised when the circuit breaker rejects a call.
#[derive(Debug, Clone, Error)]
#[error("circuit open for policy '{policy}'")]
pub struct CircuitOpenError {
    /// The policy whose circuit is open.
    pub policy: String,
}

/// Error raised when the bulkhead cannot admit a call.
#[derive(Debug, Clone, Error)]
#[error("bulkhead saturated for policy '{policy}': {max_parallel} running, {max_queue} queued")]
pub struct BulkheadRejectedError {
    /// The policy whose bulkhead is saturated.
    pub policy: String,
    /// The configured concurrency bound.
    pub max_parallel: usize,
    /// The configured queue bound.
    pub max_queue: usize,
}

/// Error raised when the caller cancels an in-flight call.
#[derive(Debug, Clone, Error)]
#[error("call cancelled: {reason}")]
pub struct CancelledError {
    /// The reason supplied to the cancellation token.
    pub reason: String,
}

/// Error raised when a policy configuration fails validation.
#[derive(Debug, Clone, Error)]
pub enum PolicyConfigError {
    /// `max_parallel` must admit at least one call.
    #[error("max_parallel must be >= 1")]
    ZeroParallelism,

    /// The failure ratio must be a usable threshold.
    #[error("failure_ratio must be in (0.0, 1.0], got {0}")]
    InvalidFailureRatio(f64),

    /// The sampling window must be non-empty.
    #[error("sampling_window_ms must be >= 1")]
    EmptySamplingWindow,

    /// The breaker needs a minimum sample count to act on.
    #[error("minimum_throughput must be >= 1")]
    ZeroThroughput,

    /// Attempts need a duration budget.
    #[error("attempt_timeout_ms must be >= 1")]
    ZeroTimeout,

    /// An open circuit needs a cool-down period.
    #[error("break_duration_ms must be >= 1")]
    ZeroBreakDuration,

    /// The backoff cap must not undercut the base delay.
    #[error("max_backoff_ms ({max}) must be >= backoff_base_ms ({base})")]
    BackoffCapBelowBase {
        /// The configured base delay.
        base: u64,
        /// The configured cap.
        max: u64,
    },
}
