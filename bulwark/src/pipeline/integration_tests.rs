//! End-to-end pipeline tests: retry accounting, breaker transitions,
//! bulkhead saturation, cancellation, and fallback degradation.

use crate::breaker::BreakerPhase;
use crate::cancellation::CancellationToken;
use crate::classify::{Classification, FnClassifier, TransientByDefault};
use crate::errors::{BoxError, ExecutionFailure, FailureKind};
use crate::events::CollectingEventSink;
use crate::fallback::FnFallback;
use crate::pipeline::ResiliencePipeline;
use crate::policy::PolicyConfig;
use crate::retry::JitterStrategy;
use crate::testing::{FlakyOperation, HangingOperation, RecordingProbe, ScriptStep, ScriptedOperation};
use futures::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::assert_ok;

fn quiet_policy(name: &str) -> PolicyConfig {
    PolicyConfig::new(name)
        .with_attempt_timeout_ms(1000)
        .with_max_retries(3)
        .with_backoff_base_ms(1)
        .with_jitter(JitterStrategy::None)
}

fn pipeline_with_sink(policy: PolicyConfig) -> (Arc<ResiliencePipeline>, Arc<CollectingEventSink>) {
    let sink = Arc::new(CollectingEventSink::new());
    let pipeline = ResiliencePipeline::new(policy)
        .expect("policy should validate")
        .with_event_sink(sink.clone());
    (Arc::new(pipeline), sink)
}

#[tokio::test]
async fn test_success_on_first_attempt() {
    let (pipeline, sink) = pipeline_with_sink(quiet_policy("first-try"));
    let token = CancellationToken::new();
    let op = FlakyOperation::new(0);

    let runner = op.clone();
    let output = pipeline
        .execute(&token, &TransientByDefault, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect("should succeed");

    assert_eq!(output.attempts, 1);
    assert!(!output.is_degraded());
    assert_eq!(op.calls(), 1);
    assert_eq!(sink.events_of_type("attempt.started").len(), 1);
    assert!(sink.events_of_type("retry.scheduled").is_empty());
}

#[tokio::test]
async fn test_persistent_failure_attempted_exactly_max_retries_plus_one() {
    // max_retries = n means exactly n + 1 total attempts, never more.
    let (pipeline, _sink) = pipeline_with_sink(quiet_policy("exhaust").with_max_retries(3));
    let token = CancellationToken::new();
    let op = ScriptedOperation::new(vec![ScriptStep::Fail("always down".to_string())]);

    let runner = op.clone();
    let failure = pipeline
        .execute(&token, &TransientByDefault, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect_err("should exhaust retries");

    assert_eq!(failure.kind, FailureKind::RetriesExhausted);
    assert_eq!(failure.attempts, 4);
    assert_eq!(op.calls(), 4);
    assert!(failure.error.to_string().contains("always down"));
}

#[tokio::test]
async fn test_permanent_failure_never_retried() {
    let (pipeline, sink) = pipeline_with_sink(quiet_policy("permanent"));
    let token = CancellationToken::new();
    let op = ScriptedOperation::new(vec![ScriptStep::Fail("bad request".to_string())]);

    let classifier = FnClassifier::new(|_: &BoxError| Classification::Permanent);
    let runner = op.clone();
    let failure = pipeline
        .execute(&token, &classifier, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect_err("should fail");

    assert_eq!(failure.kind, FailureKind::OperationError);
    assert_eq!(failure.attempts, 1);
    assert_eq!(op.calls(), 1);
    assert!(sink.events_of_type("retry.scheduled").is_empty());
}

#[tokio::test]
async fn test_transient_failures_then_success_with_backoff() {
    // Fails transiently 3 times, succeeds on the 4th attempt after
    // ~(100 + 200 + 400)ms of cumulative backoff.
    let policy = quiet_policy("backoff")
        .with_max_retries(3)
        .with_backoff_base_ms(100);
    let (pipeline, sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();
    let op = FlakyOperation::new(3);

    let started = Instant::now();
    let runner = op.clone();
    let output = pipeline
        .execute(&token, &TransientByDefault, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect("should recover");
    let elapsed = started.elapsed();

    assert_eq!(output.attempts, 4);
    assert_eq!(op.calls(), 4);
    assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "elapsed {elapsed:?}");

    let scheduled = sink.events_of_type("retry.scheduled");
    assert_eq!(scheduled.len(), 3);
    let delays: Vec<u64> = scheduled
        .iter()
        .map(|(_, data)| data.as_ref().unwrap()["delay_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(delays, vec![100, 200, 400]);
}

#[tokio::test]
async fn test_timeout_is_transient_and_retried() {
    let policy = quiet_policy("slowpoke")
        .with_attempt_timeout_ms(20)
        .with_max_retries(2);
    let (pipeline, sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();
    let op = ScriptedOperation::new(vec![
        ScriptStep::Hang(Duration::from_secs(60)),
        ScriptStep::Succeed("recovered".to_string()),
    ]);

    let runner = op.clone();
    let output = pipeline
        .execute(&token, &TransientByDefault, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect("second attempt should succeed");

    assert_eq!(output.value, "recovered");
    assert_eq!(output.attempts, 2);
    assert_eq!(sink.events_of_type("attempt.timeout").len(), 1);
}

#[tokio::test]
async fn test_all_timeouts_exhaust_as_retries_exhausted() {
    let policy = quiet_policy("dead-slow")
        .with_attempt_timeout_ms(10)
        .with_max_retries(1);
    let (pipeline, _sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();
    let op = ScriptedOperation::new(vec![ScriptStep::Hang(Duration::from_secs(60))]);

    let runner = op.clone();
    let failure = pipeline
        .execute(&token, &TransientByDefault, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect_err("should time out twice");

    assert_eq!(failure.kind, FailureKind::RetriesExhausted);
    assert_eq!(failure.attempts, 2);
}

#[tokio::test]
async fn test_zero_retry_budget_surfaces_timeout_kind() {
    let policy = quiet_policy("one-shot")
        .with_attempt_timeout_ms(10)
        .with_max_retries(0);
    let (pipeline, _sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();
    let op = ScriptedOperation::new(vec![ScriptStep::Hang(Duration::from_secs(60))]);

    let runner = op.clone();
    let failure = pipeline
        .execute(&token, &TransientByDefault, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect_err("should time out");

    assert_eq!(failure.kind, FailureKind::Timeout);
    assert_eq!(failure.attempts, 1);
}

#[tokio::test]
async fn test_breaker_opens_and_rejects_without_invoking_operation() {
    // 6 failures + 4 successes inside the window trips ratio 0.5 at
    // throughput 10; the 11th call must be rejected with zero invocations.
    let policy = quiet_policy("trippy")
        .with_max_retries(0)
        .with_failure_ratio(0.5)
        .with_minimum_throughput(10)
        .with_sampling_window_ms(10_000)
        .with_break_duration_ms(60_000);
    let (pipeline, sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();

    for i in 0..10 {
        let succeed = i < 4;
        let result = pipeline
            .execute(&token, &TransientByDefault, move |_t| async move {
                if succeed {
                    Ok("ok".to_string())
                } else {
                    Err::<String, BoxError>("down".into())
                }
            })
            .await;
        assert_eq!(result.is_ok(), succeed);
    }

    assert_eq!(pipeline.breaker_phase(), BreakerPhase::Open);
    assert_eq!(sink.events_of_type("breaker.opened").len(), 1);

    let probe = FlakyOperation::new(0);
    let runner = probe.clone();
    let failure = pipeline
        .execute(&token, &TransientByDefault, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect_err("should short-circuit");

    assert_eq!(failure.kind, FailureKind::CircuitOpen);
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn test_breaker_half_opens_after_break_duration() {
    let policy = quiet_policy("healing")
        .with_max_retries(0)
        .with_failure_ratio(0.5)
        .with_minimum_throughput(4)
        .with_break_duration_ms(80);
    let (pipeline, sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();

    for _ in 0..4 {
        let _ = pipeline
            .execute(&token, &TransientByDefault, |_t| async {
                Err::<String, BoxError>("down".into())
            })
            .await;
    }
    assert_eq!(pipeline.breaker_phase(), BreakerPhase::Open);

    // Before the break duration elapses, calls are still rejected.
    let early = FlakyOperation::new(0);
    let runner = early.clone();
    let failure = pipeline
        .execute(&token, &TransientByDefault, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect_err("still open");
    assert_eq!(failure.kind, FailureKind::CircuitOpen);
    assert_eq!(early.calls(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // After the break, the next call goes through as the probe and its
    // success closes the circuit.
    let probe = FlakyOperation::new(0);
    let runner = probe.clone();
    let output = pipeline
        .execute(&token, &TransientByDefault, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect("probe should succeed");

    assert_eq!(probe.calls(), 1);
    assert!(!output.is_degraded());
    assert_eq!(pipeline.breaker_phase(), BreakerPhase::Closed);
    assert_eq!(sink.events_of_type("breaker.half_opened").len(), 1);
    assert_eq!(sink.events_of_type("breaker.closed").len(), 1);
}

#[tokio::test]
async fn test_open_circuit_short_circuits_remaining_retries() {
    // Trip the breaker with concurrent traffic while a retrying call
    // sleeps its backoff; the next attempt must fail fast.
    let policy = quiet_policy("mid-retry")
        .with_max_retries(5)
        .with_backoff_base_ms(80)
        .with_failure_ratio(0.5)
        .with_minimum_throughput(2)
        .with_break_duration_ms(60_000);
    let (pipeline, _sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();

    let op = ScriptedOperation::new(vec![ScriptStep::Fail("down".to_string())]);
    let runner = op.clone();
    let retrying = {
        let pipeline = pipeline.clone();
        let token = token.clone();
        tokio::spawn(async move {
            pipeline
                .execute(&token, &TransientByDefault, move |t| {
                    let op = runner.clone();
                    async move { op.run(t).await }
                })
                .await
        })
    };

    // Two fast failures trip the breaker while the first call backs off.
    tokio::time::sleep(Duration::from_millis(20)).await;
    for _ in 0..2 {
        let _ = pipeline
            .execute(&token, &TransientByDefault, |_t| async {
                Err::<String, BoxError>("down".into())
            })
            .await;
    }
    assert_eq!(pipeline.breaker_phase(), BreakerPhase::Open);

    let failure = tokio::time::timeout(Duration::from_secs(5), retrying)
        .await
        .expect("should not sleep out the full budget")
        .expect("task should not panic")
        .expect_err("should fail");

    assert_eq!(failure.kind, FailureKind::CircuitOpen);
    // The breaker interceded before the retry budget was spent.
    assert!(op.calls() < 6, "calls: {}", op.calls());
}

#[tokio::test]
async fn test_bulkhead_bounds_concurrency_and_queues_overflow() {
    // k = 2 slots, queue depth 1: three concurrent calls mean at most two
    // running; the third queues and is admitted when a slot frees.
    let policy = quiet_policy("narrow")
        .with_max_parallel(2)
        .with_max_queue(1)
        .with_queue_timeout_ms(5000)
        .with_attempt_timeout_ms(10_000)
        .with_max_retries(0);
    let (pipeline, _sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();
    let op = HangingOperation::new();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let pipeline = pipeline.clone();
        let token = token.clone();
        let op = op.clone();
        handles.push(tokio::spawn(async move {
            pipeline
                .execute(&token, &TransientByDefault, move |t| {
                    let op = op.clone();
                    async move { op.run(t).await }
                })
                .await
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(op.running(), 2);
    assert_eq!(pipeline.active_count(), 2);

    op.release_all();
    for handle in handles {
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("should finish")
            .expect("task should not panic");
        assert!(result.is_ok());
    }
}

#[tokio::test]
async fn test_bulkhead_rejects_beyond_queue_and_does_not_retry() {
    let policy = quiet_policy("packed")
        .with_max_parallel(1)
        .with_max_queue(0)
        .with_attempt_timeout_ms(10_000)
        .with_max_retries(5);
    let (pipeline, sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();
    let op = HangingOperation::new();

    let holder = {
        let pipeline = pipeline.clone();
        let token = token.clone();
        let op = op.clone();
        tokio::spawn(async move {
            pipeline
                .execute(&token, &TransientByDefault, move |t| {
                    let op = op.clone();
                    async move { op.run(t).await }
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(op.running(), 1);

    let started = Instant::now();
    let failure = pipeline
        .execute(&token, &TransientByDefault, |_t| async {
            Ok::<String, BoxError>("never admitted".to_string())
        })
        .await
        .expect_err("should be rejected");

    // Fast-fail with a single attempt: rejection is not retried.
    assert_eq!(failure.kind, FailureKind::BulkheadRejected);
    assert_eq!(failure.attempts, 1);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(sink.events_of_type("bulkhead.rejected").len(), 1);

    op.release_all();
    let held = tokio::time::timeout(Duration::from_secs(5), holder)
        .await
        .expect("holder should finish")
        .expect("task should not panic");
    assert!(held.is_ok());
}

#[tokio::test]
async fn test_cancellation_terminal_and_no_breaker_sample() {
    let policy = quiet_policy("cancelled")
        .with_attempt_timeout_ms(10_000)
        .with_max_retries(5)
        .with_minimum_throughput(1)
        .with_failure_ratio(0.01);
    let (pipeline, _sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();
    let op = HangingOperation::new();

    let call = {
        let pipeline = pipeline.clone();
        let token = token.clone();
        let op = op.clone();
        tokio::spawn(async move {
            pipeline
                .execute(&token, &TransientByDefault, move |t| {
                    let op = op.clone();
                    async move { op.run(t).await }
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel("client disconnect");

    let failure = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("should return promptly")
        .expect("task should not panic")
        .expect_err("should be cancelled");

    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.attempts, 1);
    // Cancellation is not a health signal: even with a hair-trigger
    // threshold the breaker stays closed.
    assert_eq!(pipeline.breaker_phase(), BreakerPhase::Closed);
    // The held slot was released on the cancellation path.
    assert_eq!(pipeline.active_count(), 0);
}

#[tokio::test]
async fn test_fallback_masks_exhausted_retries() {
    let policy = quiet_policy("degraded").with_max_retries(1);
    let (pipeline, sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();
    let probe = RecordingProbe::new();

    let recorder = probe.clone();
    let fallback = FnFallback::new(move |failure: &ExecutionFailure| {
        recorder.record(format!("{}:{}", failure.kind, failure.error));
        async { Ok::<_, BoxError>("cached value".to_string()) }.boxed()
    });

    let output = pipeline
        .execute_with_fallback(
            &token,
            &TransientByDefault,
            |_t| async { Err::<String, BoxError>("primary down".into()) },
            &fallback,
        )
        .await
        .expect("fallback should serve");

    assert_eq!(output.value, "cached value");
    assert!(output.is_degraded());
    let masked = output.degraded.expect("degraded cause");
    assert_eq!(masked.kind, FailureKind::RetriesExhausted);

    // The fallback saw the original failure, and the event stream
    // references it too.
    let seen = probe.seen();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("retries_exhausted:"));

    let invoked = sink.events_of_type("fallback.invoked");
    assert_eq!(invoked.len(), 1);
    let data = invoked[0].1.as_ref().unwrap();
    assert_eq!(data["original_kind"], "retries_exhausted");
    assert!(data["original_error"]
        .as_str()
        .unwrap()
        .contains("primary down"));
}

#[tokio::test]
async fn test_fallback_failure_surfaces_original_error() {
    let policy = quiet_policy("closed-fail").with_max_retries(0);
    let (pipeline, _sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();

    let classifier = FnClassifier::new(|_: &BoxError| Classification::Permanent);
    let fallback = FnFallback::new(|_failure: &ExecutionFailure| {
        async { Err::<String, BoxError>("cache miss".into()) }.boxed()
    });

    let failure = pipeline
        .execute_with_fallback(
            &token,
            &classifier,
            |_t| async { Err::<String, BoxError>("bad input".into()) },
            &fallback,
        )
        .await
        .expect_err("should fail closed");

    assert_eq!(failure.kind, FailureKind::OperationError);
    assert!(failure.error.to_string().contains("bad input"));
}

#[tokio::test]
async fn test_fallback_catches_circuit_open() {
    let policy = quiet_policy("breaker-fallback")
        .with_max_retries(0)
        .with_failure_ratio(0.5)
        .with_minimum_throughput(2)
        .with_break_duration_ms(60_000);
    let (pipeline, _sink) = pipeline_with_sink(policy);
    let token = CancellationToken::new();

    for _ in 0..2 {
        let _ = pipeline
            .execute(&token, &TransientByDefault, |_t| async {
                Err::<String, BoxError>("down".into())
            })
            .await;
    }
    assert_eq!(pipeline.breaker_phase(), BreakerPhase::Open);

    let fallback = FnFallback::new(|_failure: &ExecutionFailure| {
        async { Ok::<_, BoxError>("stale but serviceable".to_string()) }.boxed()
    });

    let output = pipeline
        .execute_with_fallback(
            &token,
            &TransientByDefault,
            |_t| async { Ok::<String, BoxError>("unreachable".to_string()) },
            &fallback,
        )
        .await
        .expect("fallback should serve");

    assert!(output.is_degraded());
    assert_eq!(
        output.degraded.expect("degraded cause").kind,
        FailureKind::CircuitOpen
    );
}

#[tokio::test]
async fn test_identical_configs_classify_identically() {
    // Two pipelines from identical configs, fed identical deterministic
    // operations, must produce identical result classifications.
    let config = quiet_policy("twin").with_max_retries(2);
    let (first, _) = pipeline_with_sink(config.clone());
    let (second, _) = pipeline_with_sink(config);
    let token = CancellationToken::new();

    for pipeline in [first, second] {
        let op = FlakyOperation::new(5);
        let runner = op.clone();
        let failure = pipeline
            .execute(&token, &TransientByDefault, move |t| {
                let op = runner.clone();
                async move { op.run(t).await }
            })
            .await
            .expect_err("should exhaust");
        assert_eq!(failure.kind, FailureKind::RetriesExhausted);
        assert_eq!(failure.attempts, 3);
        assert_eq!(op.calls(), 3);
    }
}

#[tokio::test]
async fn test_classifier_distinguishes_error_messages() {
    let (pipeline, _sink) = pipeline_with_sink(quiet_policy("typed").with_max_retries(2));
    let token = CancellationToken::new();

    let classifier = FnClassifier::new(|error: &BoxError| {
        if error.to_string().contains("offline") {
            Classification::Transient
        } else {
            Classification::Permanent
        }
    });

    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = calls.clone();
    let result = pipeline
        .execute(&token, &classifier, move |_t| {
            let calls = counter.clone();
            async move {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                if n <= 2 {
                    Err::<String, BoxError>(anyhow::anyhow!("sensor offline ({n})").into())
                } else {
                    Ok(format!("reading {n}"))
                }
            }
        })
        .await;

    let output = tokio_test::assert_ok!(result);
    assert_eq!(output.attempts, 3);
    assert_eq!(output.value, "reading 3");
}

#[tokio::test]
async fn test_events_carry_correlation_id_and_policy() {
    let (pipeline, sink) = pipeline_with_sink(quiet_policy("tagged").with_max_retries(1));
    let token = CancellationToken::new();
    let op = FlakyOperation::new(1);

    let runner = op.clone();
    let output = pipeline
        .execute(&token, &TransientByDefault, move |t| {
            let op = runner.clone();
            async move { op.run(t).await }
        })
        .await
        .expect("should recover");

    let correlation = output.correlation_id.to_string();
    let events = sink.events();
    assert!(!events.is_empty());
    for (event_type, data) in events {
        let data = data.expect("all pipeline events carry data");
        assert_eq!(data["policy"], "tagged", "event {event_type}");
        assert_eq!(data["correlation_id"].as_str().unwrap(), correlation);
    }
}
