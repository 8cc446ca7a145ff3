//! Durable run records with integrity validation.
//!
//! Each run is stored as one JSON record wrapped in an envelope carrying a
//! SHA-256 checksum of the run. Writes go to a temporary file that is
//! synced and then renamed over the previous record, so a reader never
//! observes a partially written run.
//!
//! Aborts are recorded separately as a marker that saves never touch. Once a
//! marker exists the run reads back as aborted, whatever status a still
//! running executor writes afterwards.

use crate::workflow::error::CheckpointError;
use crate::workflow::state::{RunStatus, RunSummary, WorkflowRun};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Current on-disk record format.
pub const FORMAT_VERSION: u32 = 1;

const MAX_RUN_ID_LEN: usize = 128;

/// Persistence for run records.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the record for `run_id`, if one exists.
    async fn load(&self, run_id: &str) -> Result<Option<WorkflowRun>, CheckpointError>;

    /// Atomically replaces the record for `run.run_id`.
    ///
    /// Records that fail [`WorkflowRun::validate`] are rejected.
    async fn save(&self, run: &WorkflowRun) -> Result<(), CheckpointError>;

    /// Summaries of all stored runs, most recently updated first.
    async fn list(&self) -> Result<Vec<RunSummary>, CheckpointError>;

    /// Deletes the record and abort marker for `run_id`. Returns false if
    /// there was neither.
    async fn clear(&self, run_id: &str) -> Result<bool, CheckpointError>;

    /// Durably marks `run_id` as aborted.
    ///
    /// From then on [`load`](Self::load) and [`list`](Self::list) report the
    /// run as [`RunStatus::Aborted`] until it is cleared.
    async fn request_abort(&self, run_id: &str) -> Result<(), CheckpointError>;

    /// Returns true if [`request_abort`](Self::request_abort) was called for `run_id`.
    async fn abort_requested(&self, run_id: &str) -> Result<bool, CheckpointError>;
}

fn apply_abort(mut run: WorkflowRun, aborted: bool) -> WorkflowRun {
    if aborted {
        run.status = RunStatus::Aborted;
    }
    run
}

/// Checks that a run id is usable as a file name.
///
/// Allowed: ASCII letters, digits, `-`, `_` and `.`; not starting with `.`;
/// at most 128 characters.
pub fn validate_run_id(run_id: &str) -> Result<(), CheckpointError> {
    let valid = !run_id.is_empty()
        && run_id.len() <= MAX_RUN_ID_LEN
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidRunId(run_id.to_string()))
    }
}

/// On-disk envelope around a run.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    format_version: u32,
    /// SHA-256 of the serialized run
    checksum: String,
    run: WorkflowRun,
}

impl CheckpointRecord {
    fn seal(run: &WorkflowRun) -> Result<Self, CheckpointError> {
        Ok(Self {
            format_version: FORMAT_VERSION,
            checksum: compute_checksum(run)?,
            run: run.clone(),
        })
    }

    fn open(self, run_id: &str) -> Result<WorkflowRun, CheckpointError> {
        if self.format_version != FORMAT_VERSION {
            return Err(CheckpointError::Corrupted {
                run_id: run_id.to_string(),
                reason: format!("unsupported format version {}", self.format_version),
            });
        }
        let expected = compute_checksum(&self.run)?;
        if expected != self.checksum {
            return Err(CheckpointError::Corrupted {
                run_id: run_id.to_string(),
                reason: format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, self.checksum
                ),
            });
        }
        if self.run.run_id != run_id {
            return Err(CheckpointError::Corrupted {
                run_id: run_id.to_string(),
                reason: format!("record belongs to run '{}'", self.run.run_id),
            });
        }
        Ok(self.run)
    }
}

fn compute_checksum(run: &WorkflowRun) -> Result<String, CheckpointError> {
    let json = serde_json::to_vec(run)?;
    let mut hasher = Sha256::new();
    hasher.update(&json);
    Ok(format!("{:x}", hasher.finalize()))
}

fn sort_summaries(summaries: &mut [RunSummary]) {
    summaries.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
}

/// File-backed store: one `<run_id>.json` per run under a directory.
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    fn abort_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.aborted", run_id))
    }

    async fn remove_if_present(path: &Path) -> Result<bool, CheckpointError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_record(&self, path: &Path, run_id: &str) -> Result<Option<WorkflowRun>, CheckpointError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CheckpointRecord =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupted {
                run_id: run_id.to_string(),
                reason: format!("unreadable record: {}", e),
            })?;
        let run = record.open(run_id)?;
        let aborted = tokio::fs::try_exists(self.abort_path(run_id)).await?;
        Ok(Some(apply_abort(run, aborted)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, run_id: &str) -> Result<Option<WorkflowRun>, CheckpointError> {
        validate_run_id(run_id)?;
        self.read_record(&self.record_path(run_id), run_id).await
    }

    async fn save(&self, run: &WorkflowRun) -> Result<(), CheckpointError> {
        validate_run_id(&run.run_id)?;
        run.validate()?;

        let record = CheckpointRecord::seal(run)?;
        let bytes = serde_json::to_vec_pretty(&record)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let final_path = self.record_path(&run.run_id);
        let tmp_path = self
            .dir
            .join(format!(".{}.{}.tmp", run.run_id, Uuid::new_v4().simple()));

        let write = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &final_path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        // make the rename itself durable
        #[cfg(unix)]
        {
            if let Ok(dir) = tokio::fs::File::open(&self.dir).await {
                let _ = dir.sync_all().await;
            }
        }

        debug!(
            run_id = %run.run_id,
            status = %run.status,
            checkpoints = run.checkpoints.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RunSummary>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(run_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .map(str::to_string)
            else {
                continue;
            };
            if validate_run_id(&run_id).is_err() {
                continue;
            }
            match self.read_record(&path, &run_id).await {
                Ok(Some(run)) => summaries.push(RunSummary::from_run(&run)),
                Ok(None) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "Skipping unreadable checkpoint"),
            }
        }

        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn clear(&self, run_id: &str) -> Result<bool, CheckpointError> {
        validate_run_id(run_id)?;
        let record = Self::remove_if_present(&self.record_path(run_id)).await?;
        let marker = Self::remove_if_present(&self.abort_path(run_id)).await?;
        Ok(record || marker)
    }

    async fn request_abort(&self, run_id: &str) -> Result<(), CheckpointError> {
        validate_run_id(run_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::File::create(self.abort_path(run_id)).await?;
        file.write_all(chrono::Utc::now().to_rfc3339().as_bytes()).await?;
        file.sync_all().await?;

        #[cfg(unix)]
        {
            if let Ok(dir) = tokio::fs::File::open(&self.dir).await {
                let _ = dir.sync_all().await;
            }
        }
        debug!(run_id = %run_id, "Abort marker written");
        Ok(())
    }

    async fn abort_requested(&self, run_id: &str) -> Result<bool, CheckpointError> {
        validate_run_id(run_id)?;
        Ok(tokio::fs::try_exists(self.abort_path(run_id)).await?)
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    runs: Arc<RwLock<HashMap<String, WorkflowRun>>>,
    aborted: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, run_id: &str) -> Result<Option<WorkflowRun>, CheckpointError> {
        validate_run_id(run_id)?;
        let aborted = self.aborted.read().await.contains(run_id);
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .map(|run| apply_abort(run, aborted)))
    }

    async fn save(&self, run: &WorkflowRun) -> Result<(), CheckpointError> {
        validate_run_id(&run.run_id)?;
        run.validate()?;
        self.runs
            .write()
            .await
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RunSummary>, CheckpointError> {
        let aborted = self.aborted.read().await;
        let mut summaries: Vec<RunSummary> = self
            .runs
            .read()
            .await
            .values()
            .map(|run| {
                let run = apply_abort(run.clone(), aborted.contains(&run.run_id));
                RunSummary::from_run(&run)
            })
            .collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn clear(&self, run_id: &str) -> Result<bool, CheckpointError> {
        validate_run_id(run_id)?;
        let record = self.runs.write().await.remove(run_id).is_some();
        let marker = self.aborted.write().await.remove(run_id);
        Ok(record || marker)
    }

    async fn request_abort(&self, run_id: &str) -> Result<(), CheckpointError> {
        validate_run_id(run_id)?;
        self.aborted.write().await.insert(run_id.to_string());
        Ok(())
    }

    async fn abort_requested(&self, run_id: &str) -> Result<bool, CheckpointError> {
        validate_run_id(run_id)?;
        Ok(self.aborted.read().await.contains(run_id))
    }
}
