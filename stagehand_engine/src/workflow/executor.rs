//! Resumable, checkpointed stage executor.
//!
//! [`WorkflowExecutor::start_or_resume`] runs an ordered stage list under a
//! run id. Every stage outcome is written to the [`CheckpointStore`] before
//! the next stage starts, so a restarted process skips stages that already
//! succeeded. A per-run lease lock keeps two executors off the same run.
//!
//! Stage failures do not surface as errors: they end up in the returned
//! run's status and checkpoints.
//!
//! [`WorkflowExecutor::abort`] writes the store's abort marker before the
//! record. The driving executor checks that marker before every stage and
//! after every write, so an abort that races a checkpoint still ends the run
//! as aborted.

use crate::workflow::cancellation::{CancellationToken, CancellationTokenSource};
use crate::workflow::checkpoint::{validate_run_id, CheckpointStore, FileCheckpointStore};
use crate::workflow::error::WorkflowError;
use crate::workflow::lock::{LockError, RunLockGuard, RunLockManager};
use crate::workflow::retry::{RecoveryCleanup, RetryCleanup, RetryHandler, RetryScope};
use crate::workflow::stage::{Stage, StageContext, StageRegistry, StageSettings};
use crate::workflow::state::{RunStatus, RunSummary, StageOutcome, WorkflowRun};
use crate::workflow::yaml::WorkflowPlan;
use stagehand_core::{
    LocatorResolver, PageActions, PageProbe, PageStateClassifier, RecoveryController,
    RecoveryTable,
};
use stagehand_runtime::{MetricsSink, RunEvent, RuntimeConfig, StageEvent};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Workflow name recorded by [`WorkflowExecutor::start_or_resume`].
pub const DEFAULT_WORKFLOW_NAME: &str = "default";

type ActiveRuns = Arc<Mutex<HashMap<String, CancellationTokenSource>>>;

/// Removes a run from the in-process active set when dropped.
struct ActiveRun {
    runs: ActiveRuns,
    run_id: String,
}

impl ActiveRun {
    fn register(runs: &ActiveRuns, run_id: &str, source: CancellationTokenSource) -> Self {
        runs.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.to_string(), source);
        Self {
            runs: runs.clone(),
            run_id: run_id.to_string(),
        }
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

/// Top-level orchestrator for checkpointed runs.
///
/// # Example
///
/// ```ignore
/// let executor = WorkflowExecutor::new(RuntimeConfig::default());
///
/// let mut registry = StageRegistry::new();
/// registry.register_fn("login", |_ctx| async { Ok(json!({})) });
/// registry.register_fn("submit", |_ctx| async { Ok(json!({ "order": 7 })) });
///
/// let run = executor
///     .start_or_resume("order-7", &["login".into(), "submit".into()], &registry)
///     .await?;
/// assert_eq!(run.status, RunStatus::Succeeded);
/// ```
#[derive(Clone)]
pub struct WorkflowExecutor {
    store: Arc<dyn CheckpointStore>,
    locks: RunLockManager,
    config: RuntimeConfig,
    retry: RetryHandler,
    metrics: Option<Arc<dyn MetricsSink>>,
    probe: Option<Arc<dyn PageProbe>>,
    actions: Option<Arc<dyn PageActions>>,
    recovery: Option<Arc<RecoveryController>>,
    locator: LocatorResolver,
    active: ActiveRuns,
}

impl WorkflowExecutor {
    /// Creates an executor storing runs and locks under `config.state_dir`.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            store: Arc::new(FileCheckpointStore::new(config.runs_dir())),
            locks: RunLockManager::new(
                config.locks_dir(),
                config.lock_lease,
                config.lock_renew_interval,
            ),
            retry: RetryHandler::new(),
            metrics: None,
            probe: None,
            actions: None,
            recovery: None,
            locator: LocatorResolver::new(config.locator_default_timeout),
            active: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Replaces the checkpoint store.
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Attaches the automation capability handed to every stage.
    pub fn with_automation(
        mut self,
        probe: Arc<dyn PageProbe>,
        actions: Arc<dyn PageActions>,
    ) -> Self {
        self.probe = Some(probe);
        self.actions = Some(actions);
        self
    }

    /// Attaches a recovery controller, used by stages and between retries.
    ///
    /// The controller keeps its own [`RecoveryConfig`](stagehand_core::RecoveryConfig);
    /// use [`with_page_rules`](Self::with_page_rules) to take it from the runtime config.
    pub fn with_recovery(mut self, recovery: Arc<RecoveryController>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Builds the recovery controller from `classifier` and `table`, bounded
    /// by the recovery rounds and settle timings of this executor's config.
    pub fn with_page_rules(
        mut self,
        classifier: Arc<PageStateClassifier>,
        table: RecoveryTable,
    ) -> Self {
        let controller = RecoveryController::new(classifier)
            .with_table(table)
            .with_config(self.config.recovery_config());
        self.recovery = Some(Arc::new(controller));
        self
    }

    pub fn with_retry_handler(mut self, retry: RetryHandler) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Starts `run_id`, or resumes it from its last checkpoint.
    ///
    /// Stages with a successful checkpoint are skipped. Returns the run in
    /// its final status; stage failures are reported through that status,
    /// not as errors.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::LockHeld`] if another executor is running `run_id`
    /// - [`WorkflowError::UnknownStage`], [`WorkflowError::DuplicateStage`],
    ///   [`WorkflowError::EmptyWorkflow`] for an unusable stage list
    /// - [`WorkflowError::RunAborted`] if the run was aborted
    /// - [`WorkflowError::StagePlanChanged`] if the stored run lists other stages
    pub async fn start_or_resume(
        &self,
        run_id: &str,
        stages: &[String],
        registry: &StageRegistry,
    ) -> Result<WorkflowRun, WorkflowError> {
        let settings_for = |stage: &str| {
            registry
                .settings(stage)
                .cloned()
                .unwrap_or_else(|| StageSettings::from_config(&self.config))
        };
        self.execute(run_id, DEFAULT_WORKFLOW_NAME, stages, registry, &settings_for)
            .await
    }

    /// Like [`start_or_resume`](Self::start_or_resume), with stage order and
    /// settings taken from `plan`.
    pub async fn run_plan(
        &self,
        run_id: &str,
        plan: &WorkflowPlan,
        registry: &StageRegistry,
    ) -> Result<WorkflowRun, WorkflowError> {
        let stages = plan.stage_names();
        let settings_for = |stage: &str| plan.settings_for(stage, &self.config, registry);
        self.execute(run_id, &plan.name, &stages, registry, &settings_for)
            .await
    }

    /// Stored record of `run_id`.
    pub async fn status(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        self.store
            .load(run_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(run_id.to_string()))
    }

    /// Summaries of every stored run, most recently updated first.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>, WorkflowError> {
        Ok(self.store.list().await?)
    }

    /// Marks `run_id` aborted and releases its lock.
    ///
    /// An in-flight stage observes the abort at its next suspension point.
    /// Aborting an aborted run is a no-op; a succeeded run cannot be aborted.
    pub async fn abort(&self, run_id: &str) -> Result<(), WorkflowError> {
        let mut run = self.status(run_id).await?;
        if run.status == RunStatus::Aborted {
            return Ok(());
        }
        run.transition(RunStatus::Aborted)?;
        self.store.request_abort(run_id).await?;
        self.store.save(&run).await?;

        let in_process = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned();
        match in_process {
            Some(source) => source.cancel(),
            None => self.emit_run(&run, None),
        }
        self.locks.force_release(run_id).await?;

        info!(run_id = %run_id, "Run aborted");
        Ok(())
    }

    /// Deletes the stored record of `run_id` so the id can start fresh.
    ///
    /// Refused while the run is locked. Returns false if there was no record.
    pub async fn clear(&self, run_id: &str) -> Result<bool, WorkflowError> {
        validate_run_id(run_id)?;
        if self.locks.is_locked(run_id).await? {
            return Err(WorkflowError::LockHeld(run_id.to_string()));
        }
        let removed = self.store.clear(run_id).await?;
        if removed {
            info!(run_id = %run_id, "Run record cleared");
        }
        Ok(removed)
    }

    async fn execute(
        &self,
        run_id: &str,
        workflow_name: &str,
        stages: &[String],
        registry: &StageRegistry,
        settings_for: &(dyn Fn(&str) -> StageSettings + Sync),
    ) -> Result<WorkflowRun, WorkflowError> {
        validate_run_id(run_id)?;
        validate_stage_list(stages, registry)?;

        let source = CancellationTokenSource::new();
        let guard = self
            .locks
            .acquire(run_id, source.clone())
            .await
            .map_err(|e| match e {
                LockError::Held { .. } => WorkflowError::LockHeld(run_id.to_string()),
                other => other.into(),
            })?;
        let _active = ActiveRun::register(&self.active, run_id, source.clone());

        let result = self
            .drive(
                run_id,
                workflow_name,
                stages,
                registry,
                settings_for,
                &guard,
                source.token(),
            )
            .await;

        if let Err(e) = guard.release().await {
            warn!(run_id = %run_id, error = %e, "Failed to release run lock");
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        run_id: &str,
        workflow_name: &str,
        stages: &[String],
        registry: &StageRegistry,
        settings_for: &(dyn Fn(&str) -> StageSettings + Sync),
        guard: &RunLockGuard,
        token: CancellationToken,
    ) -> Result<WorkflowRun, WorkflowError> {
        let mut run = match self.store.load(run_id).await? {
            Some(mut run) => {
                if run.status == RunStatus::Aborted {
                    return Err(WorkflowError::RunAborted(run_id.to_string()));
                }
                if run.stages != stages {
                    return Err(WorkflowError::StagePlanChanged {
                        run_id: run_id.to_string(),
                        stored: run.stages.clone(),
                        requested: stages.to_vec(),
                    });
                }
                if run.status == RunStatus::Succeeded {
                    info!(run_id = %run_id, "Run already succeeded; nothing to resume");
                    return Ok(run);
                }
                run.resume_count += 1;
                run.transition(RunStatus::Running)?;
                info!(
                    run_id = %run_id,
                    completed = run.completed_count(),
                    total = run.stages.len(),
                    resume_count = run.resume_count,
                    "Resuming run"
                );
                run
            }
            None => {
                let mut run = WorkflowRun::new(run_id, workflow_name, stages.to_vec());
                run.transition(RunStatus::Running)?;
                info!(run_id = %run_id, workflow = %workflow_name, stages = stages.len(), "Starting run");
                run
            }
        };

        let started = Instant::now();
        if !self.persist(&mut run, guard).await? {
            return Ok(self.finish(run, started));
        }

        for stage_name in stages {
            if run.is_completed(stage_name) {
                debug!(run_id = %run_id, stage = %stage_name, "Skipping completed stage");
                continue;
            }
            if !self.still_driving(&mut run, guard).await? {
                return Ok(self.finish(run, started));
            }
            let stage = registry
                .get(stage_name)
                .ok_or_else(|| WorkflowError::UnknownStage(stage_name.clone()))?;
            let settings = settings_for(stage_name);

            let outcome = self
                .run_stage(&run, stage_name, stage, &settings, &token)
                .await;
            self.emit_stage(run_id, &outcome);

            let success = outcome.success;
            let next = match (success, outcome.cancelled) {
                (true, _) => RunStatus::Running,
                (false, true) => RunStatus::Aborted,
                (false, false) => RunStatus::Failed,
            };
            if !success {
                warn!(
                    run_id = %run_id,
                    stage = %stage_name,
                    attempts = outcome.attempts,
                    error = %outcome.message,
                    "Stage failed"
                );
            }
            run.record(outcome);
            run.transition(next)?;

            let active = self.persist(&mut run, guard).await?;
            if !success || !active {
                return Ok(self.finish(run, started));
            }
        }

        run.transition(RunStatus::Succeeded)?;
        self.persist(&mut run, guard).await?;
        Ok(self.finish(run, started))
    }

    async fn run_stage(
        &self,
        run: &WorkflowRun,
        stage_name: &str,
        stage: Arc<dyn Stage>,
        settings: &StageSettings,
        token: &CancellationToken,
    ) -> StageOutcome {
        let mut base = StageContext::new(&run.run_id, &run.workflow_name, stage_name)
            .with_prior_outputs(Arc::new(run.prior_outputs()))
            .with_locator(self.locator.clone())
            .with_cancellation_token(token.clone());
        if let (Some(probe), Some(actions)) = (&self.probe, &self.actions) {
            base = base.with_automation(probe.clone(), actions.clone());
        }
        if let Some(recovery) = &self.recovery {
            base = base.with_recovery(recovery.clone());
        }

        let cleanup = match (
            &settings.desired_state,
            &self.recovery,
            &self.probe,
            &self.actions,
        ) {
            (Some(desired), Some(recovery), Some(probe), Some(actions)) => {
                let cleanup = RecoveryCleanup::new(
                    recovery.clone(),
                    probe.clone(),
                    actions.clone(),
                    desired.clone(),
                );
                Some(match &self.metrics {
                    Some(metrics) => cleanup.with_metrics(&run.run_id, metrics.clone()),
                    None => cleanup,
                })
            }
            _ => None,
        };

        let scope = RetryScope {
            stage_name,
            policy: &settings.retry_policy,
            classifier: settings.classifier.as_ref(),
            cleanup: cleanup.as_ref().map(|c| c as &dyn RetryCleanup),
            cancellation: token,
            attempt_timeout: Some(settings.timeout.duration()),
        };

        debug!(run_id = %run.run_id, stage = %stage_name, "Running stage");
        self.retry
            .execute(scope, |attempt| {
                let stage = stage.clone();
                let ctx = base.for_attempt(attempt);
                async move { stage.run(&ctx).await }
            })
            .await
    }

    /// Returns false once the run has been aborted, after adopting that status.
    ///
    /// A lost lease without an abort marker means another executor took the
    /// run over, and is an error.
    async fn still_driving(
        &self,
        run: &mut WorkflowRun,
        guard: &RunLockGuard,
    ) -> Result<bool, WorkflowError> {
        if self.store.abort_requested(&run.run_id).await? {
            return self.adopt_abort(run).await;
        }
        if let Err(e) = guard.check_held().await {
            if matches!(e, LockError::Lost(_)) && self.store.abort_requested(&run.run_id).await? {
                return self.adopt_abort(run).await;
            }
            return Err(e.into());
        }
        Ok(true)
    }

    /// Writes `run` while the lease is held.
    ///
    /// Returns false when the run was aborted before or during the write;
    /// `run` is then stored as aborted with its latest checkpoints.
    async fn persist(
        &self,
        run: &mut WorkflowRun,
        guard: &RunLockGuard,
    ) -> Result<bool, WorkflowError> {
        if !self.still_driving(run, guard).await? {
            return Ok(false);
        }
        self.store.save(run).await?;
        if self.store.abort_requested(&run.run_id).await? {
            return self.adopt_abort(run).await;
        }
        Ok(run.status != RunStatus::Aborted)
    }

    async fn adopt_abort(&self, run: &mut WorkflowRun) -> Result<bool, WorkflowError> {
        if run.status != RunStatus::Aborted {
            info!(run_id = %run.run_id, "Abort requested; stopping run");
        }
        run.status = RunStatus::Aborted;
        run.updated_at = chrono::Utc::now();
        self.store.save(run).await?;
        Ok(false)
    }

    fn finish(&self, run: WorkflowRun, started: Instant) -> WorkflowRun {
        info!(
            run_id = %run.run_id,
            status = %run.status,
            completed = run.completed_count(),
            total = run.stages.len(),
            "Run finished"
        );
        self.emit_run(&run, Some(started));
        run
    }

    fn emit_stage(&self, run_id: &str, outcome: &StageOutcome) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let event = StageEvent {
            run_id: run_id.to_string(),
            stage_name: outcome.stage_name.clone(),
            success: outcome.success,
            attempts: outcome.attempts,
            message: outcome.message.clone(),
            duration: outcome.duration(),
        };
        if let Err(e) = metrics.record_stage(&event) {
            warn!(run_id = %run_id, error = %e, "Metrics sink rejected stage event");
        }
    }

    fn emit_run(&self, run: &WorkflowRun, started: Option<Instant>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let event = RunEvent {
            run_id: run.run_id.clone(),
            workflow_name: run.workflow_name.clone(),
            status: run.status.to_string(),
            duration: started.map(|s| s.elapsed()).unwrap_or_default(),
        };
        if let Err(e) = metrics.record_run(&event) {
            warn!(run_id = %run.run_id, error = %e, "Metrics sink rejected run event");
        }
    }
}

fn validate_stage_list(stages: &[String], registry: &StageRegistry) -> Result<(), WorkflowError> {
    if stages.is_empty() {
        return Err(WorkflowError::EmptyWorkflow);
    }
    let mut seen = HashSet::new();
    for stage in stages {
        if !seen.insert(stage.as_str()) {
            return Err(WorkflowError::DuplicateStage(stage.clone()));
        }
        if !registry.contains(stage) {
            return Err(WorkflowError::UnknownStage(stage.clone()));
        }
    }
    Ok(())
}
