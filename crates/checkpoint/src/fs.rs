//! Filesystem-backed checkpoint store.
//!
//! Layout: `<root>/<run_id>/<sequence:06>-<stage>.json`. Records are written to
//! a temporary file in the run directory, fsynced, and moved into place with a
//! no-clobber rename, so a reader sees either the whole record or nothing and
//! an existing record is never replaced.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline::{
    entries_to_delete, CheckpointEntry, CheckpointError, CheckpointRecord, CheckpointStore,
    CleanupPolicy, RunId, RunSnapshot, Stage, Timestamp,
};
use tempfile::NamedTempFile;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::envelope::{file_name, parse_file_name, Envelope};

/// Blocking I/O jobs allowed at once.
const MAX_BLOCKING_JOBS: usize = 4;

/// Stores checkpoints as checksummed JSON files.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: Arc<PathBuf>,
    // Keeps a burst of saves from starving the blocking pool.
    gate: Arc<Semaphore>,
}

impl FsCheckpointStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_error("creating checkpoint directory", &root, e))?;
        Ok(Self {
            root: Arc::new(root),
            gate: Arc::new(Semaphore::new(MAX_BLOCKING_JOBS)),
        })
    }

    /// Directory holding every run.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs that have a checkpoint directory, in id order.
    pub async fn runs(&self) -> Result<Vec<RunId>, CheckpointError> {
        let root = Arc::clone(&self.root);
        self.blocking(move || {
            let mut runs = Vec::new();
            for entry in fs::read_dir(&*root).map_err(|e| io_error("listing runs", &root, e))? {
                let entry = entry.map_err(|e| io_error("listing runs", &root, e))?;
                if entry.path().is_dir() {
                    if let Some(run_id) = entry.file_name().to_str().and_then(RunId::parse) {
                        runs.push(run_id);
                    }
                }
            }
            runs.sort();
            Ok(runs)
        })
        .await
    }

    async fn blocking<T, F>(&self, job: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, CheckpointError> + Send + 'static,
    {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| CheckpointError::Storage(format!("checkpoint task failed: {e}")))?
    }
}

fn run_dir(root: &Path, run_id: RunId) -> PathBuf {
    root.join(run_id.to_string())
}

fn io_error(action: &str, path: &Path, error: std::io::Error) -> CheckpointError {
    CheckpointError::Storage(format!("{action} {}: {error}", path.display()))
}

/// Entries of one run in sequence order, derived from file names only.
fn scan(root: &Path, run_id: RunId) -> Result<Vec<(CheckpointEntry, PathBuf)>, CheckpointError> {
    let dir = run_dir(root, run_id);
    let listing = match fs::read_dir(&dir) {
        Ok(listing) => listing,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CheckpointError::NotFound { run_id })
        }
        Err(e) => return Err(io_error("listing", &dir, e)),
    };

    let mut entries = Vec::new();
    for item in listing {
        let item = item.map_err(|e| io_error("listing", &dir, e))?;
        let Some((sequence, stage)) = item.file_name().to_str().and_then(parse_file_name) else {
            continue;
        };
        let path = item.path();
        let created_at = item
            .metadata()
            .and_then(|m| m.modified())
            .map(|modified| Timestamp::from_utc(DateTime::<Utc>::from(modified)))
            .map_err(|e| io_error("reading metadata of", &path, e))?;
        entries.push((
            CheckpointEntry {
                run_id,
                stage,
                sequence,
                created_at,
            },
            path,
        ));
    }
    if entries.is_empty() {
        return Err(CheckpointError::NotFound { run_id });
    }
    entries.sort_by_key(|(entry, _)| entry.sequence);
    Ok(entries)
}

fn read_record(path: &Path, run_id: RunId, sequence: u32) -> Result<CheckpointRecord, CheckpointError> {
    let bytes = fs::read(path).map_err(|e| io_error("reading", path, e))?;
    Envelope::open(&bytes, run_id, sequence).map_err(|reason| {
        warn!(run_id = %run_id, sequence, reason = %reason, "Corrupted checkpoint");
        CheckpointError::Corrupted {
            run_id,
            sequence,
            reason,
        }
    })
}

fn write_record(root: &Path, record: &CheckpointRecord) -> Result<(), CheckpointError> {
    let dir = run_dir(root, record.run_id);
    fs::create_dir_all(&dir).map_err(|e| io_error("creating", &dir, e))?;
    let target = dir.join(file_name(record.sequence, record.stage));

    let envelope = Envelope::seal(record)
        .map_err(|e| CheckpointError::Storage(format!("encoding checkpoint: {e}")))?;
    let bytes = serde_json::to_vec_pretty(&envelope)
        .map_err(|e| CheckpointError::Storage(format!("encoding checkpoint: {e}")))?;

    let mut temp = NamedTempFile::new_in(&dir).map_err(|e| io_error("creating temp file in", &dir, e))?;
    temp.write_all(&bytes)
        .map_err(|e| io_error("writing", temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| io_error("syncing", temp.path(), e))?;
    temp.persist_noclobber(&target).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            CheckpointError::AlreadyExists {
                run_id: record.run_id,
                sequence: record.sequence,
            }
        } else {
            io_error("persisting", &target, e.error)
        }
    })?;
    sync_dir(&dir);
    Ok(())
}

/// Flushes the directory entry of a freshly renamed file. Best effort.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn save(
        &self,
        run_id: RunId,
        stage: Stage,
        state: &RunSnapshot,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let root = Arc::clone(&self.root);
        let state = state.clone();
        let record = self
            .blocking(move || {
                let sequence = match scan(&root, run_id) {
                    Ok(entries) => entries.last().map_or(1, |(e, _)| e.sequence + 1),
                    Err(CheckpointError::NotFound { .. }) => 1,
                    Err(e) => return Err(e),
                };
                let record = CheckpointRecord {
                    run_id,
                    stage,
                    sequence,
                    created_at: Timestamp::now(),
                    state,
                };
                write_record(&root, &record)?;
                Ok(record)
            })
            .await?;
        debug!(run_id = %run_id, stage = %stage, sequence = record.sequence, "Checkpoint saved");
        Ok(record)
    }

    async fn load_latest(&self, run_id: RunId) -> Result<CheckpointRecord, CheckpointError> {
        let root = Arc::clone(&self.root);
        self.blocking(move || {
            let entries = scan(&root, run_id)?;
            let (entry, path) = entries
                .last()
                .ok_or(CheckpointError::NotFound { run_id })?;
            read_record(path, run_id, entry.sequence)
        })
        .await
    }

    async fn load(&self, run_id: RunId, sequence: u32) -> Result<CheckpointRecord, CheckpointError> {
        let root = Arc::clone(&self.root);
        self.blocking(move || {
            let entries = scan(&root, run_id)?;
            let (_, path) = entries
                .iter()
                .find(|(e, _)| e.sequence == sequence)
                .ok_or(CheckpointError::NotFound { run_id })?;
            read_record(path, run_id, sequence)
        })
        .await
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        let root = Arc::clone(&self.root);
        self.blocking(move || Ok(scan(&root, run_id)?.into_iter().map(|(e, _)| e).collect()))
            .await
    }

    async fn delete(&self, run_id: RunId, policy: CleanupPolicy) -> Result<usize, CheckpointError> {
        let root = Arc::clone(&self.root);
        let removed = self
            .blocking(move || {
                let entries = scan(&root, run_id)?;
                let (metadata, paths): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
                let doomed = entries_to_delete(&metadata, policy);
                let mut removed = 0;
                for entry in &doomed {
                    if let Some(index) = metadata.iter().position(|m| m.sequence == entry.sequence) {
                        let path = &paths[index];
                        fs::remove_file(path).map_err(|e| io_error("removing", path, e))?;
                        removed += 1;
                    }
                }
                if removed == metadata.len() {
                    let dir = run_dir(&root, run_id);
                    // Leftover temp files from interrupted saves go with the run.
                    fs::remove_dir_all(&dir).map_err(|e| io_error("removing", &dir, e))?;
                }
                Ok(removed)
            })
            .await?;
        info!(run_id = %run_id, removed, ?policy, "Checkpoints pruned");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequences_increase_per_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsCheckpointStore::open(dir.path()).unwrap();
        let run_id = RunId::new_random();
        let snapshot = RunSnapshot::new("interview");

        let first = store.save(run_id, Stage::Interview, &snapshot).await.unwrap();
        let second = store.save(run_id, Stage::Complexity, &snapshot).await.unwrap();
        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert!(dir
            .path()
            .join(run_id.to_string())
            .join("000002-complexity.json")
            .is_file());
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsCheckpointStore::open(dir.path()).unwrap();
        let run_id = RunId::new_random();
        assert_eq!(
            store.load_latest(run_id).await.unwrap_err(),
            CheckpointError::NotFound { run_id }
        );
        assert!(store.runs().await.unwrap().is_empty());
    }

    #[test]
    fn existing_record_is_never_replaced() {
        let dir = tempfile::TempDir::new().unwrap();
        let record = CheckpointRecord {
            run_id: RunId::new_random(),
            stage: Stage::Design,
            sequence: 1,
            created_at: Timestamp::now(),
            state: RunSnapshot::new("a"),
        };
        write_record(dir.path(), &record).unwrap();
        assert_eq!(
            write_record(dir.path(), &record).unwrap_err(),
            CheckpointError::AlreadyExists {
                run_id: record.run_id,
                sequence: 1
            }
        );
    }
}
