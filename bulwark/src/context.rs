//! Per-call execution context.
//!
//! One [`ExecutionContext`] is created at `execute` entry and dropped at
//! return. It is exclusively owned by the in-flight call; the only state
//! shared across calls lives in the breaker and bulkhead.

use crate::events::EventSink;
use crate::utils::{generate_correlation_id, iso_timestamp};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Mutable per-call state threaded through all pipeline layers.
pub struct ExecutionContext {
    /// Correlation identifier for tracing this call across layers.
    correlation_id: Uuid,
    /// Name of the policy this call executes under.
    policy: String,
    /// Number of attempts started so far.
    attempts: AtomicU32,
    /// When the call entered the pipeline.
    started: Instant,
    /// Sink for observability events.
    sink: Arc<dyn EventSink>,
}

impl ExecutionContext {
    /// Creates a context for a new call.
    #[must_use]
    pub fn new(policy: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            correlation_id: generate_correlation_id(),
            policy: policy.into(),
            attempts: AtomicU32::new(0),
            started: Instant::now(),
            sink,
        }
    }

    /// Returns the correlation identifier.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Returns the policy name.
    #[must_use]
    pub fn policy(&self) -> &str {
        &self.policy
    }

    /// Marks the start of a new attempt and returns its 1-based number.
    pub fn begin_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the number of attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns wall-clock time elapsed since the call entered the pipeline.
    ///
    /// Monotonically non-decreasing within one call.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Emits an event tagged with this call's correlation id and policy.
    ///
    /// Non-blocking; emission failures are suppressed by the sink.
    pub fn emit(&self, event_type: &str, data: Value) {
        let mut payload = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("detail".to_string(), other);
                map
            }
        };
        payload.insert(
            "correlation_id".to_string(),
            Value::String(self.correlation_id.to_string()),
        );
        payload.insert("policy".to_string(), Value::String(self.policy.clone()));
        payload.insert("at".to_string(), Value::String(iso_timestamp()));

        self.sink.try_emit(event_type, Some(Value::Object(payload)));
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("correlation_id", &self.correlation_id)
            .field("policy", &self.policy)
            .field("attempts", &self.attempts())
            .finish()
    }
}
