//! Per-run exclusive leases backed by lock files.
//!
//! A lease is a `<run_id>.lock` file created with `create_new`, holding the
//! owner's id and an expiry. While a [`RunLockGuard`] is alive a heartbeat
//! task pushes the expiry forward. A lease whose expiry has passed belongs
//! to a crashed owner and may be taken over.
//!
//! Takeover is best-effort: two executors that observe the same stale lease
//! at the same instant can both remove it, and the `create_new` that follows
//! decides the winner.

use crate::workflow::cancellation::CancellationTokenSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ACQUIRE_TRIES: usize = 3;

/// Lock acquisition and maintenance errors.
#[derive(Error, Debug)]
pub enum LockError {
    /// Another live owner holds the lease
    #[error("Run '{run_id}' is locked (lease expires at {expires_at})")]
    Held {
        run_id: String,
        expires_at: DateTime<Utc>,
    },

    /// The lease was removed or taken over while we held it
    #[error("Lock for run '{0}' was lost")]
    Lost(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lease record could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Contents of a lock file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner_id: Uuid,
    pub run_id: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

enum LeaseState {
    Missing,
    Live(DateTime<Utc>),
    Stale(String),
}

/// Hands out run leases under a directory.
#[derive(Clone, Debug)]
pub struct RunLockManager {
    dir: PathBuf,
    lease: Duration,
    renew_interval: Duration,
}

impl RunLockManager {
    pub fn new(dir: impl Into<PathBuf>, lease: Duration, renew_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            lease,
            renew_interval,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", run_id))
    }

    fn lease_span(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::days(365))
    }

    /// Acquires the lease for `run_id`.
    ///
    /// `on_lost` is cancelled if the heartbeat finds the lease gone or owned
    /// by someone else.
    pub async fn acquire(
        &self,
        run_id: &str,
        on_lost: CancellationTokenSource,
    ) -> Result<RunLockGuard, LockError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.lock_path(run_id);
        let owner_id = Uuid::new_v4();

        for _ in 0..ACQUIRE_TRIES {
            let now = Utc::now();
            let record = LeaseRecord {
                owner_id,
                run_id: run_id.to_string(),
                pid: std::process::id(),
                acquired_at: now,
                expires_at: now + self.lease_span(),
            };

            match create_lease(&path, &record).await {
                Ok(()) => {
                    debug!(run_id = %run_id, owner = %owner_id, "Run lock acquired");
                    let heartbeat = tokio::spawn(heartbeat(
                        path.clone(),
                        record,
                        self.lease_span(),
                        self.renew_interval,
                        on_lost.clone(),
                    ));
                    return Ok(RunLockGuard {
                        run_id: run_id.to_string(),
                        path,
                        owner_id,
                        lost: on_lost,
                        heartbeat: Some(heartbeat),
                        released: false,
                    });
                }
                Err(LockError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            match self.inspect(&path).await? {
                LeaseState::Missing => continue,
                LeaseState::Live(expires_at) => {
                    return Err(LockError::Held {
                        run_id: run_id.to_string(),
                        expires_at,
                    });
                }
                LeaseState::Stale(previous) => {
                    warn!(run_id = %run_id, previous = %previous, "Taking over expired run lock");
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        // Lost every create race.
        Err(LockError::Held {
            run_id: run_id.to_string(),
            expires_at: Utc::now() + self.lease_span(),
        })
    }

    /// Returns true if a live lease exists for `run_id`.
    pub async fn is_locked(&self, run_id: &str) -> Result<bool, LockError> {
        Ok(matches!(
            self.inspect(&self.lock_path(run_id)).await?,
            LeaseState::Live(_)
        ))
    }

    /// Removes the lease for `run_id` regardless of owner.
    ///
    /// The owner's heartbeat notices on its next renewal.
    pub async fn force_release(&self, run_id: &str) -> Result<bool, LockError> {
        match tokio::fs::remove_file(self.lock_path(run_id)).await {
            Ok(()) => {
                info!(run_id = %run_id, "Run lock force-released");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect(&self, path: &Path) -> Result<LeaseState, LockError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LeaseState::Missing),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        match serde_json::from_slice::<LeaseRecord>(&bytes) {
            Ok(record) if record.expires_at > now => Ok(LeaseState::Live(record.expires_at)),
            Ok(record) => Ok(LeaseState::Stale(format!(
                "owner {} (pid {}) expired at {}",
                record.owner_id, record.pid, record.expires_at
            ))),
            Err(_) => {
                // Unreadable: either mid-write or left behind by a crash.
                let modified: DateTime<Utc> = match tokio::fs::metadata(path).await {
                    Ok(meta) => meta.modified()?.into(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(LeaseState::Missing)
                    }
                    Err(e) => return Err(e.into()),
                };
                let expires_at = modified + self.lease_span();
                if expires_at > now {
                    Ok(LeaseState::Live(expires_at))
                } else {
                    Ok(LeaseState::Stale("unreadable lease".to_string()))
                }
            }
        }
    }
}

async fn create_lease(path: &Path, record: &LeaseRecord) -> Result<(), LockError> {
    let bytes = serde_json::to_vec(record)?;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    Ok(())
}

enum Owner {
    Missing,
    Unreadable,
    Known(Uuid),
}

async fn read_owner(path: &Path) -> Owner {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<LeaseRecord>(&bytes) {
            Ok(record) => Owner::Known(record.owner_id),
            Err(_) => Owner::Unreadable,
        },
        Err(_) => Owner::Missing,
    }
}

/// Rewrites the lease in place. Never recreates a removed lease.
async fn renew(path: &Path, record: &LeaseRecord) -> Result<(), LockError> {
    let bytes = serde_json::to_vec(record)?;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    Ok(())
}

fn is_not_found(error: &LockError) -> bool {
    matches!(error, LockError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
}

async fn heartbeat(
    path: PathBuf,
    mut record: LeaseRecord,
    span: chrono::Duration,
    every: Duration,
    on_lost: CancellationTokenSource,
) {
    loop {
        tokio::time::sleep(every).await;

        let still_ours = match read_owner(&path).await {
            Owner::Known(owner) => owner == record.owner_id,
            Owner::Unreadable => true,
            Owner::Missing => false,
        };
        record.expires_at = Utc::now() + span;
        let renewed = if still_ours {
            renew(&path, &record).await
        } else {
            Ok(())
        };

        match renewed {
            Ok(()) if still_ours => {}
            Err(e) if !is_not_found(&e) => {
                warn!(run_id = %record.run_id, error = %e, "Failed to renew run lock");
            }
            _ => {
                warn!(run_id = %record.run_id, "Run lock lost; cancelling run");
                on_lost.cancel();
                return;
            }
        }
    }
}

/// Held lease; released explicitly or on drop.
#[derive(Debug)]
pub struct RunLockGuard {
    run_id: String,
    path: PathBuf,
    owner_id: Uuid,
    lost: CancellationTokenSource,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl RunLockGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Errors with [`LockError::Lost`] if the lease is no longer ours.
    pub async fn check_held(&self) -> Result<(), LockError> {
        let ours = match read_owner(&self.path).await {
            Owner::Known(owner) => owner == self.owner_id,
            Owner::Unreadable => true,
            Owner::Missing => false,
        };
        if self.lost.is_cancelled() || !ours {
            return Err(LockError::Lost(self.run_id.clone()));
        }
        Ok(())
    }

    /// Stops the heartbeat and removes the lease if it is still ours.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if matches!(read_owner(&self.path).await, Owner::Known(owner) if owner == self.owner_id) {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(run_id = %self.run_id, "Run lock released");
        Ok(())
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if self.released {
            return;
        }
        let ours = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LeaseRecord>(&bytes).ok())
            .map(|record| record.owner_id == self.owner_id)
            .unwrap_or(false);
        if ours {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
