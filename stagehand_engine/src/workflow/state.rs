//! Run records: status, stage outcomes and their invariants.

use crate::workflow::error::{CheckpointError, WorkflowError};
use crate::workflow::failure::FailureClassification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Status of a workflow run.
///
/// `pending -> running -> {succeeded, failed, aborted}`. A failed run may be
/// re-entered (`failed -> running`) or aborted; `succeeded` and `aborted`
/// are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    /// Returns true for `succeeded`, `failed` and `aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted
        )
    }

    /// Returns true if the state machine allows `self -> next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Aborted)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Aborted)
                | (Failed, Running)
                | (Failed, Aborted)
        )
    }

    /// Lowercase name, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one stage, as checkpointed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage_name: String,
    pub success: bool,
    /// Attempts made, at least 1
    pub attempts: u32,
    pub message: String,
    /// Payload owned by the stage implementation
    #[serde(default)]
    pub detail: Value,
    /// Classification of the last error, for failed outcomes
    #[serde(default)]
    pub failure: Option<FailureClassification>,
    /// The failure was caused by cancellation
    #[serde(default)]
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StageOutcome {
    /// Wall-clock duration of the stage.
    pub fn duration(&self) -> std::time::Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// One execution of a workflow, identified by `run_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stage names in execution order
    pub stages: Vec<String>,
    /// Stage name -> latest outcome
    pub checkpoints: BTreeMap<String, StageOutcome>,
    /// Number of times an existing run was re-entered
    #[serde(default)]
    pub resume_count: u32,
    /// Last error message of the failing stage
    #[serde(default)]
    pub last_error: Option<String>,
}

impl WorkflowRun {
    /// Creates a pending run with no checkpoints.
    pub fn new(
        run_id: impl Into<String>,
        workflow_name: impl Into<String>,
        stages: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            stages,
            checkpoints: BTreeMap::new(),
            resume_count: 0,
            last_error: None,
        }
    }

    /// Moves the run to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), WorkflowError> {
        if !self.status.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Returns true if `stage` has a successful checkpoint.
    pub fn is_completed(&self, stage: &str) -> bool {
        self.checkpoints
            .get(stage)
            .map(|outcome| outcome.success)
            .unwrap_or(false)
    }

    /// Number of stages with a successful checkpoint.
    pub fn completed_count(&self) -> usize {
        self.stages.iter().filter(|s| self.is_completed(s)).count()
    }

    /// First stage without a successful checkpoint.
    pub fn next_stage(&self) -> Option<&str> {
        self.stages
            .iter()
            .find(|s| !self.is_completed(s))
            .map(String::as_str)
    }

    /// Outcome of the failed stage, if any.
    pub fn failed_stage(&self) -> Option<&StageOutcome> {
        self.next_stage()
            .and_then(|stage| self.checkpoints.get(stage))
            .filter(|outcome| !outcome.success)
    }

    /// Details of successful stages, keyed by stage name.
    pub fn prior_outputs(&self) -> BTreeMap<String, Value> {
        self.checkpoints
            .iter()
            .filter(|(_, outcome)| outcome.success)
            .map(|(name, outcome)| (name.clone(), outcome.detail.clone()))
            .collect()
    }

    /// Records (or overwrites) a stage's outcome.
    pub fn record(&mut self, outcome: StageOutcome) {
        if outcome.success {
            let was_failing = self
                .checkpoints
                .get(&outcome.stage_name)
                .map(|prior| !prior.success)
                .unwrap_or(false);
            if was_failing {
                self.last_error = None;
            }
        } else {
            self.last_error = Some(outcome.message.clone());
        }
        self.updated_at = Utc::now();
        self.checkpoints.insert(outcome.stage_name.clone(), outcome);
    }

    /// Checks the record's structural invariants.
    ///
    /// - every checkpoint names a stage of the run, and stage names are unique
    /// - checkpoints form a prefix: only the first non-succeeded stage may
    ///   carry a (failed) outcome, and nothing after it is checkpointed
    /// - every outcome made at least one attempt
    /// - a succeeded run has every stage succeeded
    pub fn validate(&self) -> Result<(), CheckpointError> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.as_str()) {
                return Err(CheckpointError::InvariantViolated(format!(
                    "stage '{}' listed twice",
                    stage
                )));
            }
        }

        for name in self.checkpoints.keys() {
            if !seen.contains(name.as_str()) {
                return Err(CheckpointError::InvariantViolated(format!(
                    "checkpoint for unlisted stage '{}'",
                    name
                )));
            }
        }

        let mut frontier_passed = false;
        for stage in &self.stages {
            match self.checkpoints.get(stage) {
                Some(outcome) if frontier_passed => {
                    return Err(CheckpointError::InvariantViolated(format!(
                        "stage '{}' checkpointed after an incomplete stage ({})",
                        stage,
                        if outcome.success { "succeeded" } else { "failed" }
                    )));
                }
                Some(outcome) if outcome.success => {}
                _ => frontier_passed = true,
            }
        }

        if let Some(outcome) = self.checkpoints.values().find(|o| o.attempts == 0) {
            return Err(CheckpointError::InvariantViolated(format!(
                "stage '{}' recorded zero attempts",
                outcome.stage_name
            )));
        }

        if self.status == RunStatus::Succeeded && self.completed_count() != self.stages.len() {
            return Err(CheckpointError::InvariantViolated(
                "run marked succeeded with incomplete stages".to_string(),
            ));
        }

        Ok(())
    }
}

/// Listing entry for a stored run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub completed_stages: usize,
    pub total_stages: usize,
    pub updated_at: DateTime<Utc>,
}

impl RunSummary {
    /// Creates a summary from a run record.
    pub fn from_run(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            workflow_name: run.workflow_name.clone(),
            status: run.status,
            completed_stages: run.completed_count(),
            total_stages: run.stages.len(),
            updated_at: run.updated_at,
        }
    }
}
