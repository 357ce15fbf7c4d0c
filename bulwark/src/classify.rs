//! Outcome classification for attempt results.
//!
//! The pipeline is protocol-agnostic: it does not know whether an HTTP 503
//! is worth retrying. Callers supply an [`OutcomeClassifier`] that encodes
//! that knowledge. A successful attempt always classifies as
//! [`Classification::Success`]; the classifier is consulted only for errors.

use crate::errors::{BoxError, FailureKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict on a completed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// The attempt succeeded.
    Success,
    /// The error is likely to succeed on retry (e.g., timeout, connection reset).
    Transient,
    /// The error is retry-futile (e.g., invalid input).
    Permanent,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Decides whether an operation error is worth retrying.
///
/// Implementations must be cheap and side-effect free; the pipeline calls
/// them once per failed attempt. Returning [`Classification::Success`] for
/// an error makes no sense and is treated as [`Classification::Permanent`].
pub trait OutcomeClassifier: Send + Sync {
    /// Classifies the error of a failed attempt.
    fn classify(&self, error: &BoxError) -> Classification;
}

/// Classifier that treats every error as transient.
///
/// A reasonable default for idempotent operations where the caller has no
/// protocol knowledge to encode.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientByDefault;

impl OutcomeClassifier for TransientByDefault {
    fn classify(&self, _error: &BoxError) -> Classification {
        Classification::Transient
    }
}

/// Classifier that treats every error as permanent (never retry).
#[derive(Debug, Clone, Copy, Default)]
pub struct PermanentByDefault;

impl OutcomeClassifier for PermanentByDefault {
    fn classify(&self, _error: &BoxError) -> Classification {
        Classification::Permanent
    }
}

/// A function-based classifier.
pub struct FnClassifier<F>
where
    F: Fn(&BoxError) -> Classification + Send + Sync,
{
    func: F,
}

impl<F> FnClassifier<F>
where
    F: Fn(&BoxError) -> Classification + Send + Sync,
{
    /// Creates a new function-based classifier.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> OutcomeClassifier for FnClassifier<F>
where
    F: Fn(&BoxError) -> Classification + Send + Sync,
{
    fn classify(&self, error: &BoxError) -> Classification {
        (self.func)(error)
    }
}

impl<F> fmt::Debug for FnClassifier<F>
where
    F: Fn(&BoxError) -> Classification + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnClassifier").finish()
    }
}

/// The tagged result of one attempt, before retry/fallback handling.
///
/// Lives only inside the call that produced it.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// The attempt produced a value.
    Success(T),
    /// The attempt failed.
    Failure {
        /// Which layer produced the failure.
        kind: FailureKind,
        /// The classifier's verdict.
        class: Classification,
        /// The underlying error.
        error: BoxError,
    },
}

impl<T> AttemptOutcome<T> {
    /// Returns true if this outcome is retryable under the retry contract.
    ///
    /// Only transient operation errors and timeouts are retried; bulkhead
    /// rejections and open circuits surface immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Success(_) => false,
            Self::Failure { kind, class, .. } => {
                *class == Classification::Transient
                    && matches!(kind, FailureKind::Timeout | FailureKind::OperationError)
            }
        }
    }
}
