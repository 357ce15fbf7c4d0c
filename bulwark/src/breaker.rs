//! Circuit breaker state machine.
//!
//! One [`CircuitBreaker`] is shared by every call executing under a given
//! policy. All state lives behind a single exclusive lock; transitions
//! happen on the calling task (admission and completion), never on a
//! background timer. The sample window is pruned lazily on each read.

use crate::context::ExecutionContext;
use crate::errors::CircuitOpenError;
use crate::policy::PolicyConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Publicly observable breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerPhase {
    /// Attempts pass through and record outcome samples.
    Closed,
    /// All calls are rejected without invoking the operation.
    Open,
    /// One probe call is allowed through at a time.
    HalfOpen,
}

impl fmt::Display for BreakerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// One timestamped attempt outcome in the rolling window.
#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    success: bool,
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { since: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct BreakerInner {
    phase: Phase,
    samples: VecDeque<Sample>,
}

impl BreakerInner {
    /// Drops samples older than the sampling window.
    fn prune(&mut self, config: &PolicyConfig) {
        let window = config.sampling_window();
        let now = Instant::now();
        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Evaluates the failure ratio over the pruned window.
    ///
    /// Below `minimum_throughput` the breaker never opens, so low-traffic
    /// resources do not flap on noise.
    fn should_open(&mut self, config: &PolicyConfig) -> bool {
        self.prune(config);
        let total = self.samples.len();
        if total < config.minimum_throughput {
            return false;
        }
        let failures = self.samples.iter().filter(|s| !s.success).count();
        #[allow(clippy::cast_precision_loss)]
        let ratio = failures as f64 / total as f64;
        ratio >= config.failure_ratio
    }
}

/// Permit handed out by [`CircuitBreaker::try_acquire`].
///
/// Must be returned via exactly one of `on_success`, `on_failure`, or
/// `on_abandon` once the attempt resolves.
#[derive(Debug)]
pub struct BreakerPermit {
    probe: bool,
}

impl BreakerPermit {
    /// Returns true if this permit is the half-open probe.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

/// Shared per-policy circuit breaker.
pub struct CircuitBreaker {
    policy: Arc<PolicyConfig>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the given policy.
    #[must_use]
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        Self {
            policy,
            inner: Mutex::new(BreakerInner {
                phase: Phase::Closed,
                samples: VecDeque::new(),
            }),
        }
    }

    /// Returns the current phase.
    ///
    /// An elapsed break duration is reported as `HalfOpen` even though the
    /// transition itself happens on the next admission.
    #[must_use]
    pub fn phase(&self) -> BreakerPhase {
        let inner = self.inner.lock();
        match inner.phase {
            Phase::Closed => BreakerPhase::Closed,
            Phase::Open { since } => {
                if since.elapsed() >= self.policy.break_duration() {
                    BreakerPhase::HalfOpen
                } else {
                    BreakerPhase::Open
                }
            }
            Phase::HalfOpen { .. } => BreakerPhase::HalfOpen,
        }
    }

    /// Returns the number of samples currently in the window.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.prune(&self.policy);
        inner.samples.len()
    }

    /// Checks whether a call may proceed.
    ///
    /// Open circuits reject immediately; an elapsed break duration admits
    /// the caller as the half-open probe. While a probe is in flight all
    /// other callers are rejected as if open.
    pub fn try_acquire(&self, ctx: &ExecutionContext) -> Result<BreakerPermit, CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Closed => Ok(BreakerPermit { probe: false }),
            Phase::Open { since } => {
                if since.elapsed() >= self.policy.break_duration() {
                    inner.phase = Phase::HalfOpen {
                        probe_in_flight: true,
                    };
                    drop(inner);
                    ctx.emit("breaker.half_opened", serde_json::json!({}));
                    Ok(BreakerPermit { probe: true })
                } else {
                    Err(CircuitOpenError {
                        policy: self.policy.name.clone(),
                    })
                }
            }
            Phase::HalfOpen {
                ref mut probe_in_flight,
            } => {
                if *probe_in_flight {
                    Err(CircuitOpenError {
                        policy: self.policy.name.clone(),
                    })
                } else {
                    *probe_in_flight = true;
                    Ok(BreakerPermit { probe: true })
                }
            }
        }
    }

    /// Records a successful attempt.
    ///
    /// A successful probe closes the circuit and clears the window.
    pub fn on_success(&self, permit: BreakerPermit, ctx: &ExecutionContext) {
        let mut inner = self.inner.lock();
        if permit.probe {
            inner.phase = Phase::Closed;
            inner.samples.clear();
            drop(inner);
            ctx.emit("breaker.closed", serde_json::json!({}));
            return;
        }
        if matches!(inner.phase, Phase::Closed) {
            inner.samples.push_back(Sample {
                at: Instant::now(),
                success: true,
            });
            inner.prune(&self.policy);
        }
    }

    /// Records a failed attempt.
    ///
    /// A failed probe re-opens the circuit with a fresh `open-since`; in
    /// the closed phase the failure sample may tip the rolling ratio over
    /// the threshold and open the circuit.
    pub fn on_failure(&self, permit: BreakerPermit, ctx: &ExecutionContext) {
        let mut inner = self.inner.lock();
        if permit.probe {
            inner.phase = Phase::Open {
                since: Instant::now(),
            };
            drop(inner);
            ctx.emit(
                "breaker.opened",
                serde_json::json!({"cause": "probe_failed"}),
            );
            return;
        }
        if matches!(inner.phase, Phase::Closed) {
            inner.samples.push_back(Sample {
                at: Instant::now(),
                success: false,
            });
            if inner.should_open(&self.policy) {
                let failures = inner.samples.iter().filter(|s| !s.success).count();
                let total = inner.samples.len();
                inner.phase = Phase::Open {
                    since: Instant::now(),
                };
                drop(inner);
                ctx.emit(
                    "breaker.opened",
                    serde_json::json!({
                        "cause": "failure_ratio",
                        "failures": failures,
                        "total": total,
                    }),
                );
            }
        }
    }

    /// Releases a permit without recording a sample.
    ///
    /// Used when the attempt never completed against the resource: caller
    /// cancellation, or bulkhead rejection after breaker admission.
    /// Cancellation is a caller-side event, not a target-health signal.
    pub fn on_abandon(&self, permit: BreakerPermit) {
        if !permit.probe {
            return;
        }
        let mut inner = self.inner.lock();
        if let Phase::HalfOpen {
            ref mut probe_in_flight,
        } = inner.phase
        {
            // The probe slot frees up for the next caller.
            *probe_in_flight = false;
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("policy", &self.policy.name)
            .field("phase", &self.phase())
            .finish()
    }
}
