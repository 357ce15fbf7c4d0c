//! Pipeline composition and execution.
//!
//! [`ResiliencePipeline`] assembles the policy primitives into a fixed
//! nesting order, outermost to innermost:
//!
//! ```text
//! Fallback -> Retry -> Circuit Breaker -> Bulkhead -> Timeout -> operation
//! ```
//!
//! The order is load-bearing. Fallback sits outermost so it catches
//! failures from every inner layer. Retry wraps breaker + bulkhead +
//! timeout as a unit, so each retry re-evaluates admission and circuit
//! state. The bulkhead wraps the timeout, so a queued caller holds no
//! slot while waiting and starts its attempt clock only once admitted.

#[cfg(test)]
mod integration_tests;

use crate::breaker::{BreakerPhase, CircuitBreaker};
use crate::bulkhead::{AdmitError, Bulkhead};
use crate::cancellation::CancellationToken;
use crate::classify::{AttemptOutcome, Classification, OutcomeClassifier};
use crate::context::ExecutionContext;
use crate::errors::{
    BoxError, CancelledError, ExecutionFailure, FailureKind, PolicyConfigError,
};
use crate::events::{EventSink, NoOpEventSink};
use crate::fallback::Fallback;
use crate::policy::PolicyConfig;
use crate::retry::RetrySchedule;
use crate::timeout::{run_with_timeout, GuardOutcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A successful pipeline result.
#[derive(Debug)]
pub struct PipelineOutput<T> {
    /// The value produced by the operation or the fallback.
    pub value: T,
    /// Correlation identifier of the call.
    pub correlation_id: Uuid,
    /// Number of attempts made.
    pub attempts: u32,
    /// Wall-clock time spent inside the pipeline.
    pub elapsed: Duration,
    /// The failure the fallback masked, when the value is degraded.
    ///
    /// `None` means the primary path served the value.
    pub degraded: Option<ExecutionFailure>,
}

impl<T> PipelineOutput<T> {
    /// Returns true if the value came from the fallback path.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Result of a pipeline execution.
pub type PipelineResult<T> = Result<PipelineOutput<T>, ExecutionFailure>;

/// Wraps operations against one downstream resource with timeout,
/// bulkhead, circuit breaking, retry, and fallback.
///
/// Construct one pipeline per protected resource and share it by
/// reference; the breaker and bulkhead are the only cross-call state.
pub struct ResiliencePipeline {
    policy: Arc<PolicyConfig>,
    breaker: CircuitBreaker,
    bulkhead: Bulkhead,
    sink: Arc<dyn EventSink>,
}

impl ResiliencePipeline {
    /// Creates a pipeline from a validated policy.
    ///
    /// Events are discarded until a sink is attached with
    /// [`with_event_sink`](Self::with_event_sink).
    pub fn new(policy: PolicyConfig) -> Result<Self, PolicyConfigError> {
        policy.validate()?;
        let policy = Arc::new(policy);
        Ok(Self {
            breaker: CircuitBreaker::new(policy.clone()),
            bulkhead: Bulkhead::new(policy.clone()),
            policy,
            sink: Arc::new(NoOpEventSink),
        })
    }

    /// Attaches an event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the policy this pipeline executes under.
    #[must_use]
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Returns the breaker's current phase.
    #[must_use]
    pub fn breaker_phase(&self) -> BreakerPhase {
        self.breaker.phase()
    }

    /// Returns the number of operations currently holding a bulkhead slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.bulkhead.active_count()
    }

    /// Executes an operation under this pipeline's policy.
    ///
    /// `operation` is a factory invoked once per attempt with a
    /// per-attempt cancellation token derived from `token`; attempts
    /// within a call are strictly sequential.
    pub async fn execute<T, Op, Fut>(
        &self,
        token: &Arc<CancellationToken>,
        classifier: &dyn OutcomeClassifier,
        operation: Op,
    ) -> PipelineResult<T>
    where
        T: Send,
        Op: Fn(Arc<CancellationToken>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let ctx = ExecutionContext::new(self.policy.name.clone(), self.sink.clone());
        let value = self.run_protected(&ctx, token, classifier, &operation).await?;
        Ok(Self::output(&ctx, value, None))
    }

    /// Executes an operation, degrading to `fallback` when the inner
    /// pipeline fails.
    ///
    /// Caller cancellation is terminal and is never masked by the
    /// fallback. If the fallback itself fails, the original failure
    /// surfaces unchanged.
    pub async fn execute_with_fallback<T, Op, Fut>(
        &self,
        token: &Arc<CancellationToken>,
        classifier: &dyn OutcomeClassifier,
        operation: Op,
        fallback: &dyn Fallback<T>,
    ) -> PipelineResult<T>
    where
        T: Send,
        Op: Fn(Arc<CancellationToken>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let ctx = ExecutionContext::new(self.policy.name.clone(), self.sink.clone());
        match self.run_protected(&ctx, token, classifier, &operation).await {
            Ok(value) => Ok(Self::output(&ctx, value, None)),
            Err(failure) if failure.is_cancelled() => Err(failure),
            Err(failure) => {
                ctx.emit(
                    "fallback.invoked",
                    serde_json::json!({
                        "original_kind": failure.kind.as_str(),
                        "original_error": failure.error.to_string(),
                        "attempts": failure.attempts,
                    }),
                );
                match fallback.recover(&failure).await {
                    Ok(value) => Ok(Self::output(&ctx, value, Some(failure))),
                    Err(fallback_error) => {
                        tracing::warn!(
                            policy = %self.policy.name,
                            correlation_id = %ctx.correlation_id(),
                            error = %fallback_error,
                            "Fallback failed; surfacing original failure"
                        );
                        Err(failure)
                    }
                }
            }
        }
    }

    /// The retry loop: breaker check, bulkhead admission, guarded attempt.
    async fn run_protected<T, Op, Fut>(
        &self,
        ctx: &ExecutionContext,
        token: &Arc<CancellationToken>,
        classifier: &dyn OutcomeClassifier,
        operation: &Op,
    ) -> Result<T, ExecutionFailure>
    where
        T: Send,
        Op: Fn(Arc<CancellationToken>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let mut schedule = RetrySchedule::new();

        loop {
            if token.is_cancelled() {
                return Err(self.cancelled_failure(ctx, token));
            }

            let attempt = ctx.begin_attempt();
            ctx.emit("attempt.started", serde_json::json!({"attempt": attempt}));

            // Circuit breaker check. An open circuit mid-retry
            // short-circuits the remaining budget.
            let permit = match self.breaker.try_acquire(ctx) {
                Ok(permit) => permit,
                Err(error) => {
                    ctx.emit(
                        "attempt.failed",
                        serde_json::json!({
                            "attempt": attempt,
                            "kind": FailureKind::CircuitOpen.as_str(),
                        }),
                    );
                    return Err(self.failure(ctx, FailureKind::CircuitOpen, Box::new(error)));
                }
            };

            // Bulkhead admission. Rejections are not retried within this
            // call; immediate retry would worsen contention.
            let lease = match self.bulkhead.admit(ctx, token).await {
                Ok(lease) => lease,
                Err(AdmitError::Cancelled) => {
                    self.breaker.on_abandon(permit);
                    return Err(self.cancelled_failure(ctx, token));
                }
                Err(AdmitError::Saturated(error) | AdmitError::QueueTimeout(error)) => {
                    self.breaker.on_abandon(permit);
                    ctx.emit(
                        "attempt.failed",
                        serde_json::json!({
                            "attempt": attempt,
                            "kind": FailureKind::BulkheadRejected.as_str(),
                        }),
                    );
                    return Err(self.failure(
                        ctx,
                        FailureKind::BulkheadRejected,
                        Box::new(error),
                    ));
                }
            };

            // The attempt clock starts only once a slot is held.
            let attempt_token = token.child();
            let outcome = run_with_timeout(
                ctx,
                self.policy.attempt_timeout(),
                token,
                &attempt_token,
                operation(attempt_token.clone()),
            )
            .await;
            drop(lease);

            let attempt_outcome: AttemptOutcome<T> = match outcome {
                GuardOutcome::Completed(Ok(value)) => {
                    self.breaker.on_success(permit, ctx);
                    AttemptOutcome::Success(value)
                }
                GuardOutcome::Completed(Err(error)) => {
                    if token.is_cancelled() {
                        // The operation noticed the cancelled attempt token
                        // and bailed out; that is not a health signal.
                        self.breaker.on_abandon(permit);
                        return Err(self.cancelled_failure(ctx, token));
                    }
                    self.breaker.on_failure(permit, ctx);
                    let class = match classifier.classify(&error) {
                        // A "success" verdict on an error is nonsensical;
                        // treat it as retry-futile.
                        Classification::Success => Classification::Permanent,
                        class => class,
                    };
                    AttemptOutcome::Failure {
                        kind: FailureKind::OperationError,
                        class,
                        error,
                    }
                }
                GuardOutcome::TimedOut(error) => {
                    self.breaker.on_failure(permit, ctx);
                    AttemptOutcome::Failure {
                        kind: FailureKind::Timeout,
                        class: Classification::Transient,
                        error: Box::new(error),
                    }
                }
                GuardOutcome::Cancelled(error) => {
                    // Caller-side event, not a target-health signal: no
                    // breaker sample is recorded.
                    self.breaker.on_abandon(permit);
                    return Err(self.failure(ctx, FailureKind::Cancelled, Box::new(error)));
                }
            };

            let retryable = attempt_outcome.is_retryable();
            let (kind, class, error) = match attempt_outcome {
                AttemptOutcome::Success(value) => return Ok(value),
                AttemptOutcome::Failure { kind, class, error } => (kind, class, error),
            };

            ctx.emit(
                "attempt.failed",
                serde_json::json!({
                    "attempt": attempt,
                    "kind": kind.as_str(),
                    "classification": class.to_string(),
                    "error": error.to_string(),
                }),
            );

            if retryable && !schedule.exhausted(&self.policy) {
                let delay = schedule.next_delay(&self.policy);
                ctx.emit(
                    "retry.scheduled",
                    serde_json::json!({
                        "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "next_attempt": attempt + 1,
                    }),
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = token.cancelled() => {
                        return Err(self.cancelled_failure(ctx, token));
                    }
                }
                continue;
            }

            let final_kind = if class == Classification::Transient && self.policy.max_retries > 0
            {
                FailureKind::RetriesExhausted
            } else {
                kind
            };
            return Err(self.failure(ctx, final_kind, error));
        }
    }

    fn output<T>(
        ctx: &ExecutionContext,
        value: T,
        degraded: Option<ExecutionFailure>,
    ) -> PipelineOutput<T> {
        PipelineOutput {
            value,
            correlation_id: ctx.correlation_id(),
            attempts: ctx.attempts(),
            elapsed: ctx.elapsed(),
            degraded,
        }
    }

    fn failure(
        &self,
        ctx: &ExecutionContext,
        kind: FailureKind,
        error: BoxError,
    ) -> ExecutionFailure {
        ExecutionFailure::new(
            kind,
            self.policy.name.clone(),
            ctx.correlation_id(),
            ctx.attempts(),
            error,
        )
    }

    fn cancelled_failure(
        &self,
        ctx: &ExecutionContext,
        token: &CancellationToken,
    ) -> ExecutionFailure {
        let reason = token
            .reason()
            .unwrap_or_else(|| "caller cancelled".to_string());
        self.failure(
            ctx,
            FailureKind::Cancelled,
            Box::new(CancelledError { reason }),
        )
    }
}

impl std::fmt::Debug for ResiliencePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencePipeline")
            .field("policy", &self.policy.name)
            .field("breaker_phase", &self.breaker_phase())
            .finish()
    }
}
