//! Retry, failure classification and metrics through the executor.

mod common;

use common::*;
use serde_json::json;
use stagehand_core::RetryPolicy;
use stagehand_engine::{
    FailureClassification, RunStatus, StageError, StageRegistry, StageSettings,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_fatal_stage_stops_the_run() {
    let temp = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let executor = test_executor(temp.path()).with_metrics(sink.clone());

    let log = CallLog::new();
    let mut registry = StageRegistry::new();
    ok_stage(&mut registry, "a", &log);
    failing_stage(&mut registry, "b", &log, || {
        StageError::BusinessRule("account frozen".into())
    });
    ok_stage(&mut registry, "c", &log);

    let run = executor
        .start_or_resume("run-abc", &stage_list(&["a", "b", "c"]), &registry)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(log.calls(), vec!["a", "b"]);
    assert!(run.checkpoints["a"].success);

    let b = &run.checkpoints["b"];
    assert!(!b.success);
    assert_eq!(b.attempts, 1);
    assert_eq!(b.failure, Some(FailureClassification::Fatal));
    assert!(!run.checkpoints.contains_key("c"));
    assert_eq!(run.last_error.as_deref(), Some("Business rule violated: account frozen"));

    let stages = sink.stages.lock().unwrap();
    assert_eq!(stages.len(), 2);
    assert!(stages[0].success && !stages[1].success);
    let runs = sink.runs.lock().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "failed");
}

#[tokio::test]
async fn test_retryable_failure_exhausts_exact_attempts() {
    let temp = tempfile::tempdir().unwrap();
    let executor = test_executor(temp.path());
    let log = CallLog::new();
    let mut registry = StageRegistry::new();
    failing_stage(&mut registry, "fetch", &log, || {
        StageError::Network("connection refused".into())
    });
    registry.configure(
        "fetch",
        StageSettings::default().with_retry_policy(
            RetryPolicy::default()
                .with_max_attempts(5)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(4)),
        ),
    );

    let run = executor
        .start_or_resume("run-1", &stage_list(&["fetch"]), &registry)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(log.count("fetch"), 5);
    assert_eq!(run.checkpoints["fetch"].attempts, 5);
    assert_eq!(
        run.checkpoints["fetch"].failure,
        Some(FailureClassification::Retryable)
    );
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let temp = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let executor = test_executor(temp.path()).with_metrics(sink.clone());
    let log = CallLog::new();
    let mut registry = StageRegistry::new();
    flaky_stage(&mut registry, "a", &log, 2);
    ok_stage(&mut registry, "b", &log);

    let run = executor
        .start_or_resume("run-1", &stage_list(&["a", "b"]), &registry)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.checkpoints["a"].attempts, 3);
    assert_eq!(sink.stages.lock().unwrap()[0].attempts, 3);
    assert_eq!(sink.runs.lock().unwrap()[0].status, "succeeded");
}

#[tokio::test(start_paused = true)]
async fn test_backoff_between_attempts_never_shrinks() {
    let temp = tempfile::tempdir().unwrap();
    let executor = test_executor(temp.path());
    let starts = Arc::new(Mutex::new(Vec::new()));

    let mut registry = StageRegistry::new();
    let seen = starts.clone();
    registry
        .register_fn("poll", move |_ctx| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(Instant::now());
                Err(StageError::Timeout(Duration::from_millis(1)))
            }
        })
        .configure(
            "poll",
            StageSettings::default().with_retry_policy(
                RetryPolicy::default()
                    .with_max_attempts(6)
                    .with_base_delay(Duration::from_millis(200))
                    .with_backoff_multiplier(2.0)
                    .with_max_delay(Duration::from_secs(2))
                    .with_jitter_ratio(0.0),
            ),
        );

    executor
        .start_or_resume("run-1", &stage_list(&["poll"]), &registry)
        .await
        .unwrap();

    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 6);
    let gaps: Vec<Duration> = starts.windows(2).map(|w| w[1] - w[0]).collect();
    for pair in gaps.windows(2) {
        assert!(pair[1] >= pair[0], "backoff shrank: {:?}", gaps);
    }
    assert!(gaps[0] >= Duration::from_millis(200));
    assert!(gaps[4] >= Duration::from_secs(2));
    assert!(gaps[4] < Duration::from_millis(2100));
}

#[tokio::test]
async fn test_custom_classifier_makes_failure_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let executor = test_executor(temp.path());
    let log = CallLog::new();
    let mut registry = StageRegistry::new();
    failing_stage(&mut registry, "pay", &log, || StageError::Network("declined".into()));
    registry.configure(
        "pay",
        StageSettings::default()
            .with_classifier(Arc::new(|_: &StageError| FailureClassification::Fatal)),
    );

    let run = executor
        .start_or_resume("run-1", &stage_list(&["pay"]), &registry)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(log.count("pay"), 1);
}

#[tokio::test]
async fn test_stage_sees_prior_outputs_and_attempt_number() {
    let temp = tempfile::tempdir().unwrap();
    let executor = test_executor(temp.path());
    let log = CallLog::new();
    let mut registry = StageRegistry::new();
    ok_stage(&mut registry, "a", &log);
    registry.register_fn("b", |ctx| async move {
        if ctx.attempt < 2 {
            return Err(StageError::StateDrift("not settled".into()));
        }
        let upstream = ctx.output("a").cloned().unwrap_or_default();
        Ok(json!({ "from_a": upstream, "attempt": ctx.attempt, "run": ctx.run_id }))
    });

    let run = executor
        .start_or_resume("run-7", &stage_list(&["a", "b"]), &registry)
        .await
        .unwrap();

    assert_eq!(
        run.checkpoints["b"].detail,
        json!({ "from_a": { "stage": "a" }, "attempt": 2, "run": "run-7" })
    );
}
