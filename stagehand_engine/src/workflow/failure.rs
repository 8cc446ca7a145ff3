//! Stage errors and their retryable/fatal classification.

use serde::{Deserialize, Serialize};
use stagehand_core::{AutomationError, LocatorNotFound};
use std::time::Duration;
use thiserror::Error;

/// Tag on a caught stage error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClassification {
    /// Transient; the retry handler may try again
    Retryable,
    /// Unrecoverable; the run stops
    Fatal,
}

/// Failure raised by a stage attempt.
#[derive(Error, Debug)]
pub enum StageError {
    /// Attempt exceeded its time limit
    #[error("Stage attempt timed out after {0:?}")]
    Timeout(Duration),

    /// UI target could not be located
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// Momentary network failure
    #[error("Network error: {0}")]
    Network(String),

    /// Page drifted away from the expected state
    #[error("Page state drift: {0}")]
    StateDrift(String),

    /// Recovery could not reach the desired state within its budget
    #[error("Recovery exhausted: {0}")]
    RecoveryExhausted(String),

    /// Stage reported a business-rule violation
    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    /// Run was cancelled
    #[error("Stage cancelled")]
    Cancelled,

    /// Session could not be re-established
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Error from the automation capability
    #[error(transparent)]
    Automation(#[from] AutomationError),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<LocatorNotFound> for StageError {
    fn from(err: LocatorNotFound) -> Self {
        StageError::ElementNotFound(err.to_string())
    }
}

/// Decides whether a stage error is worth retrying.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, error: &StageError) -> FailureClassification;
}

impl<F> FailureClassifier for F
where
    F: Fn(&StageError) -> FailureClassification + Send + Sync,
{
    fn classify(&self, error: &StageError) -> FailureClassification {
        self(error)
    }
}

/// Classification by error kind.
///
/// Retryable: timeouts, element-not-found, network failures, state drift,
/// and automation errors the capability marks as transient. Everything else,
/// including unrecognised errors, is fatal.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, error: &StageError) -> FailureClassification {
        match error {
            StageError::Timeout(_)
            | StageError::ElementNotFound(_)
            | StageError::Network(_)
            | StageError::StateDrift(_) => FailureClassification::Retryable,
            StageError::Automation(e) if e.is_transient() => FailureClassification::Retryable,
            StageError::Automation(_)
            | StageError::RecoveryExhausted(_)
            | StageError::BusinessRule(_)
            | StageError::Cancelled
            | StageError::AuthenticationFailed(_)
            | StageError::Other(_) => FailureClassification::Fatal,
        }
    }
}
