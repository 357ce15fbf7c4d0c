//! Mock operations for testing pipelines.

use crate::cancellation::CancellationToken;
use crate::errors::BoxError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// An operation that fails a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct FlakyOperation {
    /// Number of failures before the first success.
    failures_before_success: u32,
    /// Number of calls made.
    calls: AtomicU32,
}

impl FlakyOperation {
    /// Creates an operation that fails `failures_before_success` times.
    #[must_use]
    pub fn new(failures_before_success: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_before_success,
            calls: AtomicU32::new(0),
        })
    }

    /// Returns the number of times the operation was invoked.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Runs one attempt.
    pub async fn run(&self, _token: Arc<CancellationToken>) -> Result<String, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures_before_success {
            Err(format!("transient failure on call {call}").into())
        } else {
            Ok(format!("succeeded on call {call}"))
        }
    }
}

/// One step in a [`ScriptedOperation`].
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Return the given value.
    Succeed(String),
    /// Fail with the given message.
    Fail(String),
    /// Sleep for the given duration, observing cancellation, then fail.
    Hang(Duration),
}

/// An operation that follows an explicit outcome script.
///
/// Steps are consumed in order; calls past the end of the script repeat
/// the last step.
#[derive(Debug)]
pub struct ScriptedOperation {
    steps: Vec<ScriptStep>,
    calls: AtomicU32,
}

impl ScriptedOperation {
    /// Creates an operation from the given script.
    ///
    /// # Panics
    ///
    /// Panics if the script is empty.
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Arc<Self> {
        assert!(!steps.is_empty(), "script must have at least one step");
        Arc::new(Self {
            steps,
            calls: AtomicU32::new(0),
        })
    }

    /// Returns the number of times the operation was invoked.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Runs one attempt.
    pub async fn run(&self, token: Arc<CancellationToken>) -> Result<String, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let step = self
            .steps
            .get(call)
            .unwrap_or_else(|| &self.steps[self.steps.len() - 1])
            .clone();

        match step {
            ScriptStep::Succeed(value) => Ok(value),
            ScriptStep::Fail(message) => Err(message.into()),
            ScriptStep::Hang(duration) => {
                tokio::select! {
                    () = tokio::time::sleep(duration) => Err("hang elapsed".into()),
                    () = token.cancelled() => {
                        Err(format!(
                            "stopped: {}",
                            token.reason().unwrap_or_else(|| "cancelled".to_string())
                        )
                        .into())
                    }
                }
            }
        }
    }
}

/// An operation that holds a slot until cancelled or released.
///
/// Useful for saturating a bulkhead deterministically.
#[derive(Debug)]
pub struct HangingOperation {
    running: AtomicU32,
    release: Arc<CancellationToken>,
}

impl HangingOperation {
    /// Creates a new hanging operation.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicU32::new(0),
            release: CancellationToken::new(),
        })
    }

    /// Returns how many invocations are currently in flight.
    #[must_use]
    pub fn running(&self) -> u32 {
        self.running.load(Ordering::SeqCst)
    }

    /// Releases every in-flight invocation, letting it succeed.
    pub fn release_all(&self) {
        self.release.cancel("released");
    }

    /// Runs one attempt, blocking until released or cancelled.
    pub async fn run(&self, token: Arc<CancellationToken>) -> Result<String, BoxError> {
        self.running.fetch_add(1, Ordering::SeqCst);
        let result = tokio::select! {
            () = self.release.cancelled() => Ok("released".to_string()),
            () = token.cancelled() => Err("cancelled while running".into()),
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Records the errors handed to a fallback, for assertions.
#[derive(Debug, Default)]
pub struct RecordingProbe {
    seen: Mutex<Vec<String>>,
}

impl RecordingProbe {
    /// Creates a new probe.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records one observation.
    pub fn record(&self, entry: impl Into<String>) {
        self.seen.lock().push(entry.into());
    }

    /// Returns all recorded observations.
    #[must_use]
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}
