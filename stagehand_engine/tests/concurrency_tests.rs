//! Run lock exclusivity and abort.

mod common;

use async_trait::async_trait;
use common::*;
use serde_json::json;
use stagehand_engine::{
    CheckpointError, CheckpointStore, FileCheckpointStore, RunStatus, RunSummary, StageRegistry,
    WorkflowError, WorkflowExecutor, WorkflowRun,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Registry with one stage that signals `entered` and then waits for `release`.
fn gated(entered: Arc<Notify>, release: Arc<Notify>) -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry.register_fn("gate", move |_ctx| {
        let entered = entered.clone();
        let release = release.clone();
        async move {
            entered.notify_one();
            release.notified().await;
            Ok(json!("passed"))
        }
    });
    registry
}

#[tokio::test]
async fn test_concurrent_start_gets_lock_held() {
    let temp = tempfile::tempdir().unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let registry = Arc::new(gated(entered.clone(), release.clone()));
    let stages = stage_list(&["gate"]);

    let first = {
        let executor = test_executor(temp.path());
        let registry = registry.clone();
        let stages = stages.clone();
        tokio::spawn(async move { executor.start_or_resume("job-1", &stages, &registry).await })
    };
    entered.notified().await;

    let second = tokio::time::timeout(
        Duration::from_secs(1),
        test_executor(temp.path()).start_or_resume("job-1", &stages, &registry),
    )
    .await
    .expect("second executor must fail fast");
    assert!(matches!(second, Err(WorkflowError::LockHeld(ref id)) if id == "job-1"));

    let busy = test_executor(temp.path());
    assert!(matches!(busy.clear("job-1").await, Err(WorkflowError::LockHeld(_))));

    release.notify_one();
    let run = first.await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);

    // Lock released on completion.
    assert!(!temp.path().join("locks").join("job-1.lock").exists());
    let again = test_executor(temp.path())
        .start_or_resume("job-1", &stages, &registry)
        .await
        .unwrap();
    assert_eq!(again.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_different_runs_proceed_in_parallel() {
    let temp = tempfile::tempdir().unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let registry = Arc::new(gated(entered.clone(), release.clone()));
    let stages = stage_list(&["gate"]);
    let executor = test_executor(temp.path());

    let first = {
        let executor = executor.clone();
        let registry = registry.clone();
        let stages = stages.clone();
        tokio::spawn(async move { executor.start_or_resume("job-1", &stages, &registry).await })
    };
    entered.notified().await;

    let log = CallLog::new();
    let mut other = StageRegistry::new();
    ok_stage(&mut other, "gate", &log);
    let run = executor.start_or_resume("job-2", &stages, &other).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);

    release.notify_one();
    assert_eq!(first.await.unwrap().unwrap().status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_abort_interrupts_uncooperative_stage() {
    let temp = tempfile::tempdir().unwrap();
    let executor = test_executor(temp.path());
    let entered = Arc::new(Notify::new());
    let log = CallLog::new();

    let mut registry = StageRegistry::new();
    ok_stage(&mut registry, "a", &log);
    let signal = entered.clone();
    registry.register_fn("stuck", move |_ctx| {
        let signal = signal.clone();
        async move {
            signal.notify_one();
            // Ignores the cancellation token entirely.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!(null))
        }
    });
    ok_stage(&mut registry, "never", &log);
    let stages = stage_list(&["a", "stuck", "never"]);

    let running = {
        let executor = executor.clone();
        let stages = stages.clone();
        tokio::spawn(async move { executor.start_or_resume("job-1", &stages, &registry).await })
    };
    entered.notified().await;

    executor.abort("job-1").await.unwrap();

    let run = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("abort must interrupt the stage")
        .unwrap()
        .unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run.checkpoints["a"].success);
    assert!(run.checkpoints["stuck"].cancelled);
    assert_eq!(log.count("never"), 0);
    assert_eq!(executor.status("job-1").await.unwrap().status, RunStatus::Aborted);
    assert!(!temp.path().join("locks").join("job-1.lock").exists());

    let mut fresh = StageRegistry::new();
    for name in ["a", "stuck", "never"] {
        ok_stage(&mut fresh, name, &log);
    }
    assert!(matches!(
        executor.start_or_resume("job-1", &stages, &fresh).await,
        Err(WorkflowError::RunAborted(_))
    ));
}

#[tokio::test]
async fn test_abort_from_another_executor_reaches_running_stage() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(temp.path());
    config.lock_lease = Duration::from_millis(500);
    config.lock_renew_interval = Duration::from_millis(50);
    let owner = stagehand_engine::WorkflowExecutor::new(config.clone());
    let other = stagehand_engine::WorkflowExecutor::new(config);

    let entered = Arc::new(Notify::new());
    let mut registry = StageRegistry::new();
    let signal = entered.clone();
    registry.register_fn("wait", move |ctx| {
        let signal = signal.clone();
        async move {
            signal.notify_one();
            ctx.cancellation_token().cancelled().await;
            Err(stagehand_engine::StageError::Cancelled)
        }
    });
    let stages = stage_list(&["wait"]);

    let running = tokio::spawn(async move { owner.start_or_resume("job-1", &stages, &registry).await });
    entered.notified().await;

    other.abort("job-1").await.unwrap();

    let run = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("heartbeat must notice the released lock")
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
}

/// File store where another executor aborts the run during one chosen save.
struct AbortDuringSave {
    inner: FileCheckpointStore,
    aborter: WorkflowExecutor,
    run_id: String,
    abort_on_save: usize,
    saves: AtomicUsize,
}

#[async_trait]
impl CheckpointStore for AbortDuringSave {
    async fn load(&self, run_id: &str) -> Result<Option<WorkflowRun>, CheckpointError> {
        self.inner.load(run_id).await
    }

    async fn save(&self, run: &WorkflowRun) -> Result<(), CheckpointError> {
        let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.abort_on_save {
            self.aborter.abort(&self.run_id).await.unwrap();
        }
        self.inner.save(run).await
    }

    async fn list(&self) -> Result<Vec<RunSummary>, CheckpointError> {
        self.inner.list().await
    }

    async fn clear(&self, run_id: &str) -> Result<bool, CheckpointError> {
        self.inner.clear(run_id).await
    }

    async fn request_abort(&self, run_id: &str) -> Result<(), CheckpointError> {
        self.inner.request_abort(run_id).await
    }

    async fn abort_requested(&self, run_id: &str) -> Result<bool, CheckpointError> {
        self.inner.abort_requested(run_id).await
    }
}

#[tokio::test]
async fn test_abort_racing_a_checkpoint_write_stays_aborted() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path());
    // save 1 marks the run running, save 2 records stage a
    let store = AbortDuringSave {
        inner: FileCheckpointStore::new(config.runs_dir()),
        aborter: test_executor(temp.path()),
        run_id: "job-1".to_string(),
        abort_on_save: 2,
        saves: AtomicUsize::new(0),
    };
    let executor = WorkflowExecutor::new(config).with_store(Arc::new(store));

    let log = CallLog::new();
    let mut registry = StageRegistry::new();
    for name in ["a", "b", "c"] {
        ok_stage(&mut registry, name, &log);
    }
    let stages = stage_list(&["a", "b", "c"]);

    let run = executor.start_or_resume("job-1", &stages, &registry).await.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(log.calls(), vec!["a"]);

    let stored = test_executor(temp.path()).status("job-1").await.unwrap();
    assert_eq!(stored.status, RunStatus::Aborted);
    assert!(stored.is_completed("a"));
    assert!(!temp.path().join("locks").join("job-1.lock").exists());

    assert!(matches!(
        test_executor(temp.path()).start_or_resume("job-1", &stages, &registry).await,
        Err(WorkflowError::RunAborted(_))
    ));
    assert_eq!(log.calls(), vec!["a"]);
}
