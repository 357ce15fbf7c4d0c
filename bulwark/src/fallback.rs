//! Fallback degradation for exhausted pipelines.
//!
//! A fallback serves degraded or cached data when every inner layer has
//! failed. It runs outside the bulkhead, so serving the degraded path
//! never consumes capacity reserved for the primary resource.

use crate::errors::{BoxError, ExecutionFailure};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;

/// Supplies a substitute result when the inner pipeline fails.
#[async_trait]
pub trait Fallback<T>: Send + Sync {
    /// Attempts to recover from the given failure.
    ///
    /// Returning `Ok` masks the failure from the caller (the original
    /// error is still emitted for observability); returning `Err` lets
    /// the original failure surface unchanged.
    async fn recover(&self, failure: &ExecutionFailure) -> Result<T, BoxError>;
}

/// A function-based fallback.
///
/// The closure receives the triggering failure and returns a boxed future
/// producing the substitute value.
pub struct FnFallback<F> {
    func: F,
}

impl<F> FnFallback<F> {
    /// Creates a new function-based fallback.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<T, F> Fallback<T> for FnFallback<F>
where
    T: Send + 'static,
    F: Fn(&ExecutionFailure) -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync,
{
    async fn recover(&self, failure: &ExecutionFailure) -> Result<T, BoxError> {
        (self.func)(failure).await
    }
}

impl<F> fmt::Debug for FnFallback<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFallback").finish()
    }
}
