//! # Bulwark
//!
//! A composable resilience pipeline for asynchronous operations.
//!
//! Bulwark wraps an arbitrary async operation with timeout enforcement,
//! concurrency limiting (bulkhead), circuit breaking, retry with backoff,
//! and fallback degradation, applied in a fixed nesting order so failure
//! semantics compose predictably:
//!
//! - **Timeout guard**: bounds a single attempt's wall-clock duration
//! - **Bulkhead**: bounds concurrent operations per protected resource
//! - **Circuit breaker**: short-circuits calls when the resource is unhealthy
//! - **Retry controller**: re-issues transient failures with backoff
//! - **Fallback**: serves degraded data when every inner layer is exhausted
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bulwark::prelude::*;
//!
//! // One pipeline per protected downstream resource.
//! let pipeline = ResiliencePipeline::new(PolicyConfig::control_plane("engine"))?
//!     .with_event_sink(Arc::new(LoggingEventSink::default()));
//!
//! let token = CancellationToken::new();
//! let output = pipeline
//!     .execute(&token, &TransientByDefault, |attempt| async move {
//!         engine_client.read_status(attempt).await
//!     })
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod breaker;
pub mod bulkhead;
pub mod cancellation;
pub mod classify;
pub mod context;
pub mod errors;
pub mod events;
pub mod fallback;
pub mod pipeline;
pub mod policy;
pub mod retry;
pub mod testing;
pub mod timeout;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::breaker::{BreakerPhase, CircuitBreaker};
    pub use crate::bulkhead::{Bulkhead, BulkheadLease};
    pub use crate::cancellation::CancellationToken;
    pub use crate::classify::{
        Classification, FnClassifier, OutcomeClassifier, PermanentByDefault, TransientByDefault,
    };
    pub use crate::context::ExecutionContext;
    pub use crate::errors::{
        BoxError, ExecutionFailure, FailureKind, PolicyConfigError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::fallback::{Fallback, FnFallback};
    pub use crate::pipeline::{PipelineOutput, PipelineResult, ResiliencePipeline};
    pub use crate::policy::PolicyConfig;
    pub use crate::retry::{BackoffStrategy, JitterStrategy};
    pub use crate::utils::{generate_correlation_id, iso_timestamp};
}
