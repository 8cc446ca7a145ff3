//! Executor-level and persistence errors.

use crate::workflow::lock::LockError;
use crate::workflow::state::RunStatus;
use thiserror::Error;

/// Error types for workflow operations.
///
/// Stage failures are not errors at this level: they end up in the run's
/// status and checkpoints, which the caller inspects.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Another executor holds the run lock
    #[error("Run '{0}' is locked by another executor")]
    LockHeld(String),

    /// Stage list references a stage with no registered implementation
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// Stage list names the same stage twice
    #[error("Duplicate stage in stage list: {0}")]
    DuplicateStage(String),

    /// Stage list is empty
    #[error("Workflow cannot be empty")]
    EmptyWorkflow,

    /// No record exists for the run
    #[error("Run not found: {0}")]
    NotFound(String),

    /// Run was aborted and cannot be resumed
    #[error("Run '{0}' was aborted and cannot be resumed")]
    RunAborted(String),

    /// Stored stage list differs from the requested one
    #[error("Stage plan for run '{run_id}' changed: stored {stored:?}, requested {requested:?}")]
    StagePlanChanged {
        run_id: String,
        stored: Vec<String>,
        requested: Vec<String>,
    },

    /// Run status transition not allowed by the state machine
    #[error("Invalid run status transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    /// Checkpoint store failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Lock file failure
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

/// Errors raised by a [`CheckpointStore`](crate::workflow::checkpoint::CheckpointStore).
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored checksum does not match the record
    #[error("Checkpoint for run '{run_id}' is corrupted: {reason}")]
    Corrupted { run_id: String, reason: String },

    /// Run id cannot be used as a record key
    #[error("Invalid run id: {0:?}")]
    InvalidRunId(String),

    /// Record breaks a run invariant and was not written
    #[error("Run record invariant violated: {0}")]
    InvariantViolated(String),
}
