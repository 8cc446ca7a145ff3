//! Metrics sink consumed by the workflow executor, plus built-in sinks.
//!
//! The executor reports every stage completion and every terminal run
//! outcome. Delivery is fire-and-forget: a sink error is logged by the
//! caller and never affects the run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Kind of metric being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Stage finished successfully
    StageSucceeded,
    /// Stage finished with a failure
    StageFailed,
    /// Extra attempt made by the retry handler
    StageRetried,
    /// Run reached `succeeded`
    RunSucceeded,
    /// Run reached `failed`
    RunFailed,
    /// Run reached `aborted`
    RunAborted,
    /// Corrective action taken during recovery
    RecoveryAction,
}

const METRIC_KINDS: usize = 7;

/// One completed stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageEvent {
    pub run_id: String,
    pub stage_name: String,
    pub success: bool,
    pub attempts: u32,
    pub message: String,
    pub duration: Duration,
}

/// Terminal run outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunEvent {
    pub run_id: String,
    pub workflow_name: String,
    /// Terminal status name (`succeeded`, `failed`, `aborted`)
    pub status: String,
    pub duration: Duration,
}

/// Receiver of workflow events.
pub trait MetricsSink: Send + Sync {
    /// Called once per completed stage (successful or not).
    fn record_stage(&self, event: &StageEvent) -> anyhow::Result<()>;

    /// Called once when a run reaches a terminal status.
    fn record_run(&self, event: &RunEvent) -> anyhow::Result<()>;

    /// Called for each corrective action taken during recovery.
    fn record_recovery(&self, _run_id: &str, _stage_name: &str, _action: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runtime metrics collector.
///
/// Tracks event counts and total stage time. Cloning shares the counters.
#[derive(Clone, Debug)]
pub struct RuntimeMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    counts: [AtomicU64; METRIC_KINDS],
    /// Total stage time (nanoseconds)
    stage_time_ns: AtomicU64,
    total_attempts: AtomicU64,
}

impl RuntimeMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                counts: Default::default(),
                stage_time_ns: AtomicU64::new(0),
                total_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Records a metric occurrence.
    pub fn record(&self, kind: MetricKind) {
        self.inner.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the count for a specific metric.
    pub fn count(&self, kind: MetricKind) -> u64 {
        self.inner.counts[kind as usize].load(Ordering::Relaxed)
    }

    /// Gets the total time spent in stages.
    pub fn stage_time(&self) -> Duration {
        Duration::from_nanos(self.inner.stage_time_ns.load(Ordering::Relaxed))
    }

    /// Gets the stage success rate (0.0 to 1.0).
    pub fn stage_success_rate(&self) -> f64 {
        let ok = self.count(MetricKind::StageSucceeded);
        let total = ok + self.count(MetricKind::StageFailed);

        if total == 0 {
            return 0.0;
        }

        ok as f64 / total as f64
    }

    /// Gets all metrics as a summary.
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            stages_succeeded: self.count(MetricKind::StageSucceeded),
            stages_failed: self.count(MetricKind::StageFailed),
            retries: self.count(MetricKind::StageRetried),
            runs_succeeded: self.count(MetricKind::RunSucceeded),
            runs_failed: self.count(MetricKind::RunFailed),
            runs_aborted: self.count(MetricKind::RunAborted),
            recovery_actions: self.count(MetricKind::RecoveryAction),
            total_attempts: self.inner.total_attempts.load(Ordering::Relaxed),
            stage_time: self.stage_time(),
        }
    }

    /// Resets all metrics to zero.
    pub fn reset(&self) {
        for count in &self.inner.counts {
            count.store(0, Ordering::Relaxed);
        }
        self.inner.stage_time_ns.store(0, Ordering::Relaxed);
        self.inner.total_attempts.store(0, Ordering::Relaxed);
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for RuntimeMetrics {
    fn record_stage(&self, event: &StageEvent) -> anyhow::Result<()> {
        if event.success {
            self.record(MetricKind::StageSucceeded);
        } else {
            self.record(MetricKind::StageFailed);
        }
        let retries = event.attempts.saturating_sub(1) as u64;
        self.inner.counts[MetricKind::StageRetried as usize].fetch_add(retries, Ordering::Relaxed);
        self.inner
            .total_attempts
            .fetch_add(event.attempts as u64, Ordering::Relaxed);
        self.inner
            .stage_time_ns
            .fetch_add(event.duration.as_nanos() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn record_run(&self, event: &RunEvent) -> anyhow::Result<()> {
        match event.status.as_str() {
            "succeeded" => self.record(MetricKind::RunSucceeded),
            "failed" => self.record(MetricKind::RunFailed),
            "aborted" => self.record(MetricKind::RunAborted),
            other => anyhow::bail!("not a terminal run status: {}", other),
        }
        Ok(())
    }

    fn record_recovery(&self, _run_id: &str, _stage_name: &str, _action: &str) -> anyhow::Result<()> {
        self.record(MetricKind::RecoveryAction);
        Ok(())
    }
}

/// Summary of runtime metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub stages_succeeded: u64,
    pub stages_failed: u64,
    pub retries: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_aborted: u64,
    pub recovery_actions: u64,
    /// Attempts across all stages
    pub total_attempts: u64,
    /// Total time spent in stages
    pub stage_time: Duration,
}

/// Sink that logs every event through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record_stage(&self, event: &StageEvent) -> anyhow::Result<()> {
        info!(
            run_id = %event.run_id,
            stage = %event.stage_name,
            success = event.success,
            attempts = event.attempts,
            duration_ms = event.duration.as_millis() as u64,
            "Stage finished"
        );
        Ok(())
    }

    fn record_run(&self, event: &RunEvent) -> anyhow::Result<()> {
        info!(
            run_id = %event.run_id,
            workflow = %event.workflow_name,
            status = %event.status,
            duration_ms = event.duration.as_millis() as u64,
            "Run finished"
        );
        Ok(())
    }

    fn record_recovery(&self, run_id: &str, stage_name: &str, action: &str) -> anyhow::Result<()> {
        info!(run_id = %run_id, stage = %stage_name, action = %action, "Recovery action");
        Ok(())
    }
}

/// Fans events out to several sinks.
///
/// Every sink receives every event; the first error (if any) is returned
/// after all sinks have been called.
#[derive(Clone, Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl CompositeSink {
    /// Creates an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn fan_out(
        &self,
        f: impl Fn(&dyn MetricsSink) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = f(sink.as_ref()) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl MetricsSink for CompositeSink {
    fn record_stage(&self, event: &StageEvent) -> anyhow::Result<()> {
        self.fan_out(|sink| sink.record_stage(event))
    }

    fn record_run(&self, event: &RunEvent) -> anyhow::Result<()> {
        self.fan_out(|sink| sink.record_run(event))
    }

    fn record_recovery(&self, run_id: &str, stage_name: &str, action: &str) -> anyhow::Result<()> {
        self.fan_out(|sink| sink.record_recovery(run_id, stage_name, action))
    }
}
