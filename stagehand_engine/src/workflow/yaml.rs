//! YAML workflow plans.
//!
//! A plan names the ordered stages of a workflow and optionally overrides
//! their retry policy, attempt timeout and desired page state. Stage
//! implementations still come from a [`StageRegistry`]; the plan only
//! shapes how they run.
//!
//! ```yaml
//! name: checkout
//! stages:
//!   - name: login
//!     desired_state: login
//!   - name: search
//!     timeout_ms: 10000
//!     retry:
//!       max_attempts: 5
//!       base_delay_ms: 200
//!   - name: submit
//! ```

use crate::workflow::stage::{StageRegistry, StageSettings};
use crate::workflow::timeout::StageTimeout;
use serde::{Deserialize, Serialize};
use stagehand_core::{PageState, PolicyError, RetryPolicy};
use stagehand_runtime::RuntimeConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating a plan.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Failed to read plan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Plan '{0}' has no stages")]
    Empty(String),

    #[error("Stage '{0}' listed twice")]
    DuplicateStage(String),

    #[error("Stage '{stage}' has an invalid retry policy: {source}")]
    InvalidRetry {
        stage: String,
        #[source]
        source: PolicyError,
    },

    #[error("Stage '{0}' has a zero timeout")]
    ZeroTimeout(String),
}

/// Partial retry policy; unset fields keep the stage's default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryOverride {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter_ratio: Option<f64>,
}

impl RetryOverride {
    /// Returns `base` with the set fields replaced.
    pub fn apply(&self, base: &RetryPolicy) -> RetryPolicy {
        let mut policy = base.clone();
        if let Some(n) = self.max_attempts {
            policy.max_attempts = n;
        }
        if let Some(ms) = self.base_delay_ms {
            policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(m) = self.backoff_multiplier {
            policy.backoff_multiplier = m;
        }
        if let Some(ms) = self.max_delay_ms {
            policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(j) = self.jitter_ratio {
            policy.jitter_ratio = j;
        }
        policy
    }
}

/// One stage entry of a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanStage {
    pub name: String,
    #[serde(default)]
    pub retry: Option<RetryOverride>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Screen name recovery drives toward between attempts
    #[serde(default)]
    pub desired_state: Option<String>,
}

impl PlanStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: None,
            timeout_ms: None,
            desired_state: None,
        }
    }
}

/// Ordered stage list of a named workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub name: String,
    pub stages: Vec<PlanStage>,
}

impl WorkflowPlan {
    /// Parses and validates a plan.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PlanError> {
        let plan: WorkflowPlan = serde_yaml::from_str(yaml)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Reads, parses and validates a plan file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| PlanError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml_str(&yaml)
    }

    /// Checks stage names are unique and overrides are usable.
    ///
    /// Retry overrides are checked against the built-in default policy.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.stages.is_empty() {
            return Err(PlanError::Empty(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(PlanError::DuplicateStage(stage.name.clone()));
            }
            if stage.timeout_ms == Some(0) {
                return Err(PlanError::ZeroTimeout(stage.name.clone()));
            }
            if let Some(retry) = &stage.retry {
                retry
                    .apply(&RetryPolicy::default())
                    .validate()
                    .map_err(|source| PlanError::InvalidRetry {
                        stage: stage.name.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Effective settings for `stage`.
    ///
    /// Starts from the registry's settings for the stage (or the runtime
    /// defaults) and applies the plan's overrides on top.
    pub fn settings_for(
        &self,
        stage: &str,
        config: &RuntimeConfig,
        registry: &StageRegistry,
    ) -> StageSettings {
        let mut settings = registry
            .settings(stage)
            .cloned()
            .unwrap_or_else(|| StageSettings::from_config(config));

        if let Some(entry) = self.stages.iter().find(|s| s.name == stage) {
            if let Some(retry) = &entry.retry {
                settings.retry_policy = retry.apply(&settings.retry_policy);
            }
            if let Some(ms) = entry.timeout_ms {
                settings.timeout = StageTimeout::from_millis(ms);
            }
            if let Some(screen) = &entry.desired_state {
                settings.desired_state = Some(PageState::ready(screen.as_str()));
            }
        }
        settings
    }
}
