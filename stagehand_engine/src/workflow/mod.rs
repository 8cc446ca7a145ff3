//! Resumable stage orchestration.
//!
//! A workflow is an ordered list of named stages executed under a run id.
//! The pieces:
//! - [`Stage`](stage::Stage) implementations looked up in a
//!   [`StageRegistry`](stage::StageRegistry)
//! - [`RetryHandler`](retry::RetryHandler): bounded retry with backoff,
//!   per-attempt timeouts and cancellation
//! - [`CheckpointStore`](checkpoint::CheckpointStore): durable run records
//! - [`RunLockManager`](lock::RunLockManager): one executor per run
//! - [`WorkflowExecutor`](executor::WorkflowExecutor): ties them together
//!
//! # Execution Model
//!
//! 1. Validate the stage list and acquire the run lock
//! 2. Load the run record, or create one
//! 3. For each stage without a successful checkpoint, run it through the
//!    retry handler and checkpoint the outcome
//! 4. Stop at the first failed stage; the run is `failed` (or `aborted` if
//!    the failure was a cancellation), else `succeeded`
//! 5. Release the lock

pub mod cancellation;
pub mod checkpoint;
pub mod error;
pub mod executor;
pub mod failure;
pub mod lock;
pub mod retry;
pub mod stage;
pub mod state;
pub mod timeout;
pub mod yaml;

pub use cancellation::{CancellationToken, CancellationTokenSource};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use error::{CheckpointError, WorkflowError};
pub use executor::{WorkflowExecutor, DEFAULT_WORKFLOW_NAME};
pub use failure::{DefaultClassifier, FailureClassification, FailureClassifier, StageError};
pub use lock::{LeaseRecord, LockError, RunLockGuard, RunLockManager};
pub use retry::{RecoveryCleanup, RetryCleanup, RetryHandler, RetryScope};
pub use stage::{FnStage, Stage, StageContext, StageRegistry, StageSettings};
pub use state::{RunStatus, RunSummary, StageOutcome, WorkflowRun};
pub use timeout::StageTimeout;
pub use yaml::{PlanError, PlanStage, RetryOverride, WorkflowPlan};
