//! Concurrency limiter (bulkhead) with bounded queueing.
//!
//! One [`Bulkhead`] is shared by every call executing under a given policy,
//! bounding how many operations run concurrently against that downstream
//! resource. Excess callers queue up to `max_queue`; beyond that they are
//! rejected immediately rather than blocked.

use crate::cancellation::CancellationToken;
use crate::context::ExecutionContext;
use crate::errors::BulkheadRejectedError;
use crate::policy::PolicyConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Why a call was not admitted.
#[derive(Debug, Error)]
pub enum AdmitError {
    /// All slots busy and the queue is full: fast-fail.
    #[error("{0}")]
    Saturated(BulkheadRejectedError),

    /// The caller queued but no slot freed within the queue timeout.
    #[error("{0}")]
    QueueTimeout(BulkheadRejectedError),

    /// The caller cancelled while waiting for admission.
    #[error("caller cancelled while queued for admission")]
    Cancelled,
}

/// A held bulkhead slot.
///
/// Releasing happens on drop, so the slot is returned on every exit path:
/// success, failure, or cancellation.
#[derive(Debug)]
pub struct BulkheadLease {
    _permit: OwnedSemaphorePermit,
}

/// Shared per-policy admission gate.
pub struct Bulkhead {
    policy: Arc<PolicyConfig>,
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
}

/// Decrements the queued-waiter gauge on every exit path.
struct QueueGuard(Arc<AtomicUsize>);

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Bulkhead {
    /// Creates a bulkhead for the given policy.
    #[must_use]
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        let semaphore = Arc::new(Semaphore::new(policy.max_parallel));
        Self {
            policy,
            semaphore,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the number of operations currently holding a slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.policy.max_parallel - self.semaphore.available_permits()
    }

    /// Returns the number of callers currently queued for admission.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn rejection(&self) -> BulkheadRejectedError {
        BulkheadRejectedError {
            policy: self.policy.name.clone(),
            max_parallel: self.policy.max_parallel,
            max_queue: self.policy.max_queue,
        }
    }

    /// Requests admission, queueing if all slots are busy.
    ///
    /// Returns a [`BulkheadLease`] once a slot is held. Rejects immediately
    /// when the queue is full, after `queue_timeout` when no slot frees up,
    /// or with [`AdmitError::Cancelled`] when the caller cancels mid-wait.
    pub async fn admit(
        &self,
        ctx: &ExecutionContext,
        token: &CancellationToken,
    ) -> Result<BulkheadLease, AdmitError> {
        // Fast path: a slot is free right now.
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(BulkheadLease { _permit: permit });
        }

        // Slow path: join the bounded queue.
        let previously_queued = self.queued.fetch_add(1, Ordering::SeqCst);
        if previously_queued >= self.policy.max_queue {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            let rejection = self.rejection();
            ctx.emit(
                "bulkhead.rejected",
                serde_json::json!({
                    "reason": "queue_full",
                    "active": self.active_count(),
                    "queued": self.queued_count(),
                }),
            );
            return Err(AdmitError::Saturated(rejection));
        }
        let _queue_guard = QueueGuard(self.queued.clone());

        tokio::select! {
            acquired = self.semaphore.clone().acquire_owned() => {
                match acquired {
                    Ok(permit) => Ok(BulkheadLease { _permit: permit }),
                    // The semaphore is never closed; treat it as saturation
                    // rather than panicking.
                    Err(_) => Err(AdmitError::Saturated(self.rejection())),
                }
            }
            () = tokio::time::sleep(self.policy.queue_timeout()) => {
                let rejection = self.rejection();
                ctx.emit(
                    "bulkhead.rejected",
                    serde_json::json!({
                        "reason": "queue_timeout",
                        "waited_ms": self.policy.queue_timeout_ms,
                    }),
                );
                Err(AdmitError::QueueTimeout(rejection))
            }
            () = token.cancelled() => Err(AdmitError::Cancelled),
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("policy", &self.policy.name)
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}
