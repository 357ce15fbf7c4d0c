//! Timeout guard for a single attempt.
//!
//! Races the operation against its duration budget and the caller's
//! cancellation. Cancellation on expiry is fire-and-forget: the attempt
//! token is cancelled and the operation future is dropped without waiting
//! for cooperatively-spawned work to observe the signal.

use crate::cancellation::CancellationToken;
use crate::context::ExecutionContext;
use crate::errors::{BoxError, CancelledError, TimeoutError};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a guarded attempt resolved.
#[derive(Debug)]
pub enum GuardOutcome<T> {
    /// The operation completed within budget; its result is unchanged.
    Completed(Result<T, BoxError>),
    /// The deadline elapsed first.
    TimedOut(TimeoutError),
    /// The caller cancelled first.
    Cancelled(CancelledError),
}

/// Runs one attempt under a duration budget.
///
/// `attempt_token` is the per-attempt child token handed to the operation;
/// it is cancelled when the deadline fires or the caller cancels, so the
/// operation can cooperatively stop work it has spawned.
pub async fn run_with_timeout<T, F>(
    ctx: &ExecutionContext,
    budget: Duration,
    caller: &CancellationToken,
    attempt_token: &Arc<CancellationToken>,
    operation: F,
) -> GuardOutcome<T>
where
    F: Future<Output = Result<T, BoxError>>,
{
    let started = Instant::now();
    tokio::pin!(operation);

    // Biased so ties resolve deterministically: caller cancellation wins
    // over completion, completion wins over the deadline.
    tokio::select! {
        biased;
        () = caller.cancelled() => {
            let reason = caller.reason().unwrap_or_else(|| "caller cancelled".to_string());
            attempt_token.cancel(reason.clone());
            GuardOutcome::Cancelled(CancelledError { reason })
        }
        result = &mut operation => GuardOutcome::Completed(result),
        () = tokio::time::sleep(budget) => {
            attempt_token.cancel("attempt timed out");
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
            ctx.emit(
                "attempt.timeout",
                serde_json::json!({
                    "budget_ms": budget_ms,
                    "elapsed_ms": elapsed_ms,
                }),
            );
            GuardOutcome::TimedOut(TimeoutError { budget_ms, elapsed_ms })
        }
    }
}
