//! Stagehand runtime layer - configuration, metrics and tracing setup.
//!
//! This crate provides the ambient services used by the workflow engine:
//!
//! - [`RuntimeConfig`]: YAML configuration with environment overrides
//! - [`metrics`]: the metrics sink consumed by the executor
//! - [`telemetry`]: `tracing` subscriber initialization

pub mod metrics;
pub mod telemetry;

use serde::{Deserialize, Serialize};
use stagehand_core::types::duration_ms;
use stagehand_core::{PolicyError, RecoveryConfig, RetryPolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use metrics::{
    CompositeSink, MetricKind, MetricsSink, MetricsSummary, RunEvent, RuntimeMetrics, StageEvent,
    TracingSink,
};

/// Environment variable overriding [`RuntimeConfig::state_dir`].
pub const ENV_STATE_DIR: &str = "STAGEHAND_STATE_DIR";
/// Environment variable overriding [`RuntimeConfig::lock_lease`] (milliseconds).
pub const ENV_LOCK_LEASE_MS: &str = "STAGEHAND_LOCK_LEASE_MS";
/// Environment variable overriding [`RuntimeConfig::recovery_max_rounds`].
pub const ENV_RECOVERY_MAX_ROUNDS: &str = "STAGEHAND_RECOVERY_MAX_ROUNDS";

/// Error loading or validating configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config text is not valid YAML for this schema.
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Environment override has an unparsable value.
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },

    /// Values are individually valid but inconsistent.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Default retry policy is invalid.
    #[error("Invalid default retry policy: {0}")]
    Retry(#[from] PolicyError),
}

/// Runtime configuration for the workflow engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root for `runs/` checkpoint records and `locks/`
    pub state_dir: PathBuf,
    /// Lease duration of a run lock
    #[serde(with = "duration_ms", rename = "lock_lease_ms")]
    pub lock_lease: Duration,
    /// Heartbeat interval renewing the lease
    #[serde(with = "duration_ms", rename = "lock_renew_interval_ms")]
    pub lock_renew_interval: Duration,
    /// Retry policy for stages without their own
    pub default_retry: RetryPolicy,
    /// Per-attempt timeout for stages without their own
    #[serde(with = "duration_ms", rename = "default_stage_timeout_ms")]
    pub default_stage_timeout: Duration,
    pub recovery_max_rounds: u32,
    #[serde(with = "duration_ms", rename = "recovery_settle_timeout_ms")]
    pub recovery_settle_timeout: Duration,
    #[serde(with = "duration_ms", rename = "recovery_poll_interval_ms")]
    pub recovery_poll_interval: Duration,
    /// Locator timeout for candidates without their own
    #[serde(with = "duration_ms", rename = "locator_default_timeout_ms")]
    pub locator_default_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".stagehand"),
            lock_lease: Duration::from_secs(60),
            lock_renew_interval: Duration::from_secs(20),
            default_retry: RetryPolicy::default(),
            default_stage_timeout: Duration::from_secs(120),
            recovery_max_rounds: 3,
            recovery_settle_timeout: Duration::from_secs(5),
            recovery_poll_interval: Duration::from_millis(100),
            locator_default_timeout: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    /// Parses a YAML document. Missing keys take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Loads a YAML file, applies environment overrides, and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&text)?.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `STAGEHAND_*` environment overrides.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(dir) = lookup(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_LOCK_LEASE_MS) {
            let ms: u64 = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_LOCK_LEASE_MS,
                value: value.clone(),
            })?;
            self.lock_lease = Duration::from_millis(ms);
        }
        if let Some(value) = lookup(ENV_RECOVERY_MAX_ROUNDS) {
            self.recovery_max_rounds = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_RECOVERY_MAX_ROUNDS,
                value: value.clone(),
            })?;
        }
        Ok(self)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_lease.is_zero() {
            return Err(ConfigError::Invalid("lock lease must be non-zero".to_string()));
        }
        if self.lock_renew_interval.is_zero() || self.lock_renew_interval >= self.lock_lease {
            return Err(ConfigError::Invalid(format!(
                "lock renew interval ({:?}) must be non-zero and shorter than the lease ({:?})",
                self.lock_renew_interval, self.lock_lease
            )));
        }
        if self.default_stage_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "default stage timeout must be non-zero".to_string(),
            ));
        }
        self.default_retry.validate()?;
        Ok(())
    }

    /// Directory holding checkpoint records.
    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    /// Directory holding run lock files.
    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// Recovery timings derived from this config.
    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            max_rounds: self.recovery_max_rounds,
            settle_timeout: self.recovery_settle_timeout,
            poll_interval: self.recovery_poll_interval,
        }
    }
}
