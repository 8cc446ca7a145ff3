//! Stagehand engine - resumable, checkpointed stage orchestration.
//!
//! This crate runs multi-step automation jobs against an unreliable remote
//! application:
//!
//! - Stages: named units of business logic with their own retry policy
//! - Retry: bounded attempts with exponential backoff and jitter
//! - Checkpoints: every stage outcome is durable before the next stage runs
//! - Locking: a lease per run keeps concurrent executors apart
//! - Recovery: between retries the page is driven back to a known state
//!
//! Page classification, recovery and locator fallback live in
//! `stagehand_core`; configuration and metrics in `stagehand_runtime`.
//!
//! # Example
//!
//! ```ignore
//! use stagehand_engine::{RunStatus, StageRegistry, WorkflowExecutor};
//! use stagehand_runtime::RuntimeConfig;
//!
//! let executor = WorkflowExecutor::new(RuntimeConfig::load("stagehand.yaml")?);
//! let mut registry = StageRegistry::new();
//! registry.register_fn("login", |ctx| async move { /* ... */ Ok(serde_json::json!({})) });
//!
//! let run = executor.start_or_resume("job-42", &["login".into()], &registry).await?;
//! if run.status == RunStatus::Failed {
//!     eprintln!("{}", run.last_error.unwrap_or_default());
//! }
//! ```

pub mod workflow;

pub use workflow::{
    CancellationToken, CancellationTokenSource, CheckpointError, CheckpointStore,
    DefaultClassifier, FailureClassification, FailureClassifier, FileCheckpointStore, FnStage,
    InMemoryCheckpointStore, LockError, PlanError, RecoveryCleanup, RetryCleanup, RetryHandler,
    RetryScope, RunLockManager, RunStatus, RunSummary, Stage, StageContext, StageError,
    StageOutcome, StageRegistry, StageSettings, StageTimeout, WorkflowError, WorkflowExecutor,
    WorkflowPlan, WorkflowRun,
};
