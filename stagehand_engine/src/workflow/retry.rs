//! Bounded retry with exponential backoff and jitter.
//!
//! [`RetryHandler`] is the only place in the engine that retries. Each
//! attempt runs under its own timeout; between attempts the handler sleeps
//! for the policy's backoff, racing the run's cancellation token, and then
//! runs an optional [`RetryCleanup`] hook.

use crate::workflow::cancellation::CancellationToken;
use crate::workflow::failure::{FailureClassification, FailureClassifier, StageError};
use crate::workflow::state::StageOutcome;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use stagehand_core::{PageActions, PageProbe, PageState, RecoveryController, RetryPolicy};
use stagehand_runtime::MetricsSink;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Hook run between a failed attempt and the next one.
#[async_trait]
pub trait RetryCleanup: Send + Sync {
    /// Resets partial side effects of the failed attempt.
    ///
    /// An error stops retrying if its classification is fatal.
    async fn cleanup(&self, stage_name: &str, failed_attempt: u32) -> Result<(), StageError>;
}

/// Cleanup that drives the page back to a stage's desired state.
pub struct RecoveryCleanup {
    controller: Arc<RecoveryController>,
    probe: Arc<dyn PageProbe>,
    actions: Arc<dyn PageActions>,
    desired: PageState,
    run_id: String,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl RecoveryCleanup {
    pub fn new(
        controller: Arc<RecoveryController>,
        probe: Arc<dyn PageProbe>,
        actions: Arc<dyn PageActions>,
        desired: PageState,
    ) -> Self {
        Self {
            controller,
            probe,
            actions,
            desired,
            run_id: String::new(),
            metrics: None,
        }
    }

    /// Reports corrective actions for `run_id` to `metrics`.
    pub fn with_metrics(mut self, run_id: impl Into<String>, metrics: Arc<dyn MetricsSink>) -> Self {
        self.run_id = run_id.into();
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl RetryCleanup for RecoveryCleanup {
    async fn cleanup(&self, stage_name: &str, failed_attempt: u32) -> Result<(), StageError> {
        let report = self
            .controller
            .recover(
                self.probe.as_ref(),
                self.actions.as_ref(),
                &self.desired,
                self.controller.config().max_rounds,
            )
            .await;

        if let Some(metrics) = &self.metrics {
            for action in &report.actions {
                if let Err(e) =
                    metrics.record_recovery(&self.run_id, stage_name, &format!("{:?}", action))
                {
                    warn!(error = %e, "Metrics sink rejected recovery event");
                }
            }
        }

        if report.reached {
            debug!(stage = %stage_name, attempt = failed_attempt, "Page ready for retry");
            Ok(())
        } else {
            Err(StageError::RecoveryExhausted(format!(
                "wanted {}, still {} after {} round(s)",
                self.desired,
                report.final_state,
                report.rounds()
            )))
        }
    }
}

/// Everything that shapes one retried execution.
pub struct RetryScope<'a> {
    pub stage_name: &'a str,
    pub policy: &'a RetryPolicy,
    pub classifier: &'a dyn FailureClassifier,
    pub cleanup: Option<&'a dyn RetryCleanup>,
    pub cancellation: &'a CancellationToken,
    /// Limit for each attempt; `None` means unbounded
    pub attempt_timeout: Option<Duration>,
}

type JitterFn = dyn Fn() -> f64 + Send + Sync;

/// Runs an action under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryHandler {
    /// Returns a value in `[-1, 1]`
    jitter: Arc<JitterFn>,
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryHandler {
    /// Handler with uniform random jitter.
    pub fn new() -> Self {
        Self {
            jitter: Arc::new(|| rand::thread_rng().gen_range(-1.0..=1.0)),
        }
    }

    /// Handler that always waits the nominal delay.
    pub fn without_jitter() -> Self {
        Self {
            jitter: Arc::new(|| 0.0),
        }
    }

    /// Handler with a custom jitter source.
    pub fn with_jitter_source(source: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        Self {
            jitter: Arc::new(source),
        }
    }

    /// Delay after failed attempt `attempt` under `policy`.
    pub fn backoff_delay(&self, policy: &RetryPolicy, attempt: u32) -> Duration {
        policy.jittered_delay(attempt, (self.jitter)())
    }

    /// Calls `action(attempt)` until it succeeds, fails fatally, or the
    /// policy's attempts are exhausted.
    ///
    /// Never returns an error: the outcome records success or the last
    /// failure together with the number of attempts made.
    pub async fn execute<F, Fut>(&self, scope: RetryScope<'_>, mut action: F) -> StageOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Value, StageError>>,
    {
        let started_at = Utc::now();
        let max_attempts = scope.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = if scope.cancellation.is_cancelled() {
                Err(StageError::Cancelled)
            } else {
                let call = action(attempt);
                let bounded = async {
                    match scope.attempt_timeout {
                        Some(limit) => tokio::time::timeout(limit, call)
                            .await
                            .unwrap_or(Err(StageError::Timeout(limit))),
                        None => call.await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = scope.cancellation.cancelled() => Err(StageError::Cancelled),
                    result = bounded => result,
                }
            };

            let error = match result {
                Ok(detail) => {
                    debug!(stage = %scope.stage_name, attempt, "Stage attempt succeeded");
                    return StageOutcome {
                        stage_name: scope.stage_name.to_string(),
                        success: true,
                        attempts: attempt,
                        message: format!("completed after {} attempt(s)", attempt),
                        detail,
                        failure: None,
                        cancelled: false,
                        started_at,
                        finished_at: Utc::now(),
                    };
                }
                Err(error) => error,
            };

            let classification = classify(&scope, &error);
            if classification == FailureClassification::Fatal || attempt >= max_attempts {
                if classification == FailureClassification::Retryable {
                    warn!(
                        stage = %scope.stage_name,
                        attempts = attempt,
                        error = %error,
                        "Retry attempts exhausted"
                    );
                }
                return failed(&scope, started_at, attempt, classification, &error);
            }

            let delay = self.backoff_delay(scope.policy, attempt);
            warn!(
                stage = %scope.stage_name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Stage attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = scope.cancellation.cancelled() => {
                    return failed(
                        &scope,
                        started_at,
                        attempt,
                        FailureClassification::Fatal,
                        &StageError::Cancelled,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if let Some(cleanup) = scope.cleanup {
                let result = tokio::select! {
                    biased;
                    _ = scope.cancellation.cancelled() => Err(StageError::Cancelled),
                    result = cleanup.cleanup(scope.stage_name, attempt) => result,
                };
                if matches!(result, Err(StageError::Cancelled)) {
                    return failed(
                        &scope,
                        started_at,
                        attempt,
                        FailureClassification::Fatal,
                        &StageError::Cancelled,
                    );
                }
                if let Err(cleanup_error) = result {
                    let classification = classify(&scope, &cleanup_error);
                    warn!(
                        stage = %scope.stage_name,
                        error = %cleanup_error,
                        ?classification,
                        "Retry cleanup failed"
                    );
                    if classification == FailureClassification::Fatal {
                        return failed(&scope, started_at, attempt, classification, &cleanup_error);
                    }
                }
            }

            attempt += 1;
        }
    }
}

fn classify(scope: &RetryScope<'_>, error: &StageError) -> FailureClassification {
    if matches!(error, StageError::Cancelled) || scope.cancellation.is_cancelled() {
        return FailureClassification::Fatal;
    }
    scope.classifier.classify(error)
}

fn failed(
    scope: &RetryScope<'_>,
    started_at: chrono::DateTime<Utc>,
    attempts: u32,
    classification: FailureClassification,
    error: &StageError,
) -> StageOutcome {
    StageOutcome {
        stage_name: scope.stage_name.to_string(),
        success: false,
        attempts,
        message: error.to_string(),
        detail: Value::Null,
        failure: Some(classification),
        cancelled: matches!(error, StageError::Cancelled) || scope.cancellation.is_cancelled(),
        started_at,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::cancellation::CancellationTokenSource;
    use crate::workflow::failure::DefaultClassifier;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter_ratio(0.0)
    }

    fn scope<'a>(
        policy: &'a RetryPolicy,
        token: &'a CancellationToken,
        cleanup: Option<&'a dyn RetryCleanup>,
    ) -> RetryScope<'a> {
        RetryScope {
            stage_name: "submit",
            policy,
            classifier: &DefaultClassifier,
            cleanup,
            cancellation: token,
            attempt_timeout: Some(Duration::from_secs(10)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let policy = policy(3);
        let token = CancellationToken::never();
        let outcome = RetryHandler::new()
            .execute(scope(&policy, &token, None), |_| async { Ok(json!({"ok": true})) })
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.detail, json!({"ok": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_exhausts_exactly_max_attempts() {
        let policy = policy(4);
        let token = CancellationToken::never();
        let calls = AtomicU32::new(0);

        let outcome = RetryHandler::new()
            .execute(scope(&policy, &token, None), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::Network("reset".into())) }
            })
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.failure, Some(FailureClassification::Retryable));
        assert!(outcome.message.contains("reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_short_circuits() {
        let policy = policy(5);
        let token = CancellationToken::never();
        let calls = AtomicU32::new(0);

        let outcome = RetryHandler::new()
            .execute(scope(&policy, &token, None), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::BusinessRule("card declined".into())) }
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.failure, Some(FailureClassification::Fatal));
        assert!(!outcome.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_later_attempt() {
        let policy = policy(3);
        let token = CancellationToken::never();

        let outcome = RetryHandler::new()
            .execute(scope(&policy, &token, None), |attempt| async move {
                if attempt < 3 {
                    Err(StageError::ElementNotFound("spinner".into()))
                } else {
                    Ok(json!(attempt))
                }
            })
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_follow_policy() {
        let policy = policy(4).with_backoff_multiplier(3.0);
        let token = CancellationToken::never();
        let starts = Mutex::new(Vec::new());
        let origin = Instant::now();

        RetryHandler::without_jitter()
            .execute(scope(&policy, &token, None), |_| {
                starts.lock().unwrap().push(origin.elapsed());
                async { Err(StageError::Network("down".into())) }
            })
            .await;

        let starts = starts.into_inner().unwrap();
        let gaps: Vec<Duration> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        // 100ms, 300ms, then 900ms
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(900)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_becomes_retryable_timeout() {
        let policy = policy(2);
        let token = CancellationToken::never();
        let mut scope = scope(&policy, &token, None);
        scope.attempt_timeout = Some(Duration::from_millis(50));

        let outcome = RetryHandler::new()
            .execute(scope, |attempt| async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(json!(attempt))
            })
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff_stops_immediately() {
        let policy = policy(5).with_base_delay(Duration::from_secs(30)).with_max_delay(Duration::from_secs(30));
        let source = CancellationTokenSource::new();
        let token = source.token();
        let calls = AtomicU32::new(0);

        let canceller = {
            let source = source.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                source.cancel();
            })
        };

        let origin = Instant::now();
        let outcome = RetryHandler::new()
            .execute(scope(&policy, &token, None), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::Timeout(Duration::from_millis(1))) }
            })
            .await;
        canceller.await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(origin.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_uncooperative_attempt() {
        let policy = policy(3);
        let source = CancellationTokenSource::new();
        let token = source.token();

        let canceller = {
            let source = source.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                source.cancel();
            })
        };

        let outcome = RetryHandler::new()
            .execute(scope(&policy, &token, None), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            })
            .await;
        canceller.await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.failure, Some(FailureClassification::Fatal));
    }

    struct CountingCleanup {
        calls: AtomicU32,
        fail_with: Option<fn() -> StageError>,
    }

    #[async_trait]
    impl RetryCleanup for CountingCleanup {
        async fn cleanup(&self, _stage_name: &str, _failed_attempt: u32) -> Result<(), StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_runs_between_attempts() {
        let policy = policy(3);
        let token = CancellationToken::never();
        let cleanup = CountingCleanup {
            calls: AtomicU32::new(0),
            fail_with: None,
        };

        let outcome = RetryHandler::new()
            .execute(scope(&policy, &token, Some(&cleanup)), |_| async {
                Err(StageError::StateDrift("dialog open".into()))
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(cleanup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_cleanup_failure_stops_retrying() {
        let policy = policy(3);
        let token = CancellationToken::never();
        let cleanup = CountingCleanup {
            calls: AtomicU32::new(0),
            fail_with: Some(|| StageError::RecoveryExhausted("overlay stuck".into())),
        };
        let calls = AtomicU32::new(0);

        let outcome = RetryHandler::new()
            .execute(scope(&policy, &token, Some(&cleanup)), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::StateDrift("overlay".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.failure, Some(FailureClassification::Fatal));
        assert!(outcome.message.contains("overlay stuck"));
    }

    struct SlowCleanup;

    #[async_trait]
    impl RetryCleanup for SlowCleanup {
        async fn cleanup(&self, _stage_name: &str, _failed_attempt: u32) -> Result<(), StageError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_slow_cleanup() {
        let policy = policy(3);
        let source = CancellationTokenSource::new();
        let token = source.token();
        let calls = AtomicU32::new(0);

        // Fires after the 100ms backoff, while cleanup is running.
        let canceller = {
            let source = source.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                source.cancel();
            })
        };

        let origin = Instant::now();
        let outcome = RetryHandler::new()
            .execute(scope(&policy, &token, Some(&SlowCleanup)), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::StateDrift("overlay".into())) }
            })
            .await;
        canceller.await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.failure, Some(FailureClassification::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(origin.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = RetryPolicy::default();
        let handler = RetryHandler::new();
        for attempt in 1..10 {
            let nominal = policy.nominal_delay(attempt).as_secs_f64();
            let delay = handler.backoff_delay(&policy, attempt).as_secs_f64();
            assert!(delay >= nominal * 0.8 - 1e-9);
            assert!(delay <= policy.max_delay.as_secs_f64() + 1e-9);
        }
    }
}
