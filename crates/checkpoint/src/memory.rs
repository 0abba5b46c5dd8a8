//! In-process checkpoint store for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pipeline::{
    entries_to_delete, CheckpointEntry, CheckpointError, CheckpointRecord, CheckpointStore,
    CleanupPolicy, RunId, RunSnapshot, Stage, Timestamp,
};

#[derive(Debug, Default)]
struct Inner {
    runs: BTreeMap<RunId, Vec<CheckpointRecord>>,
    corrupted: BTreeSet<(RunId, u32)>,
}

/// Keeps checkpoints in memory. Records can be marked corrupted to exercise
/// recovery paths.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<Inner>,
}

impl MemoryCheckpointStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later read of the record fail as corrupted.
    pub fn corrupt(&self, run_id: RunId, sequence: u32) {
        self.lock().corrupted.insert((run_id, sequence));
    }

    /// Runs with at least one checkpoint.
    pub fn runs(&self) -> Vec<RunId> {
        self.lock().runs.keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn records(&self, run_id: RunId) -> Result<&Vec<CheckpointRecord>, CheckpointError> {
        self.runs
            .get(&run_id)
            .filter(|records| !records.is_empty())
            .ok_or(CheckpointError::NotFound { run_id })
    }

    fn read(&self, record: &CheckpointRecord) -> Result<CheckpointRecord, CheckpointError> {
        if self.corrupted.contains(&(record.run_id, record.sequence)) {
            return Err(CheckpointError::Corrupted {
                run_id: record.run_id,
                sequence: record.sequence,
                reason: "marked corrupted".to_string(),
            });
        }
        Ok(record.clone())
    }
}

fn entry(record: &CheckpointRecord) -> CheckpointEntry {
    CheckpointEntry {
        run_id: record.run_id,
        stage: record.stage,
        sequence: record.sequence,
        created_at: record.created_at,
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(
        &self,
        run_id: RunId,
        stage: Stage,
        state: &RunSnapshot,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let mut inner = self.lock();
        let records = inner.runs.entry(run_id).or_default();
        let record = CheckpointRecord {
            run_id,
            stage,
            sequence: records.last().map_or(1, |r| r.sequence + 1),
            created_at: Timestamp::now(),
            state: state.clone(),
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn load_latest(&self, run_id: RunId) -> Result<CheckpointRecord, CheckpointError> {
        let inner = self.lock();
        let latest = inner
            .records(run_id)?
            .last()
            .ok_or(CheckpointError::NotFound { run_id })?;
        inner.read(latest)
    }

    async fn load(&self, run_id: RunId, sequence: u32) -> Result<CheckpointRecord, CheckpointError> {
        let inner = self.lock();
        let record = inner
            .records(run_id)?
            .iter()
            .find(|r| r.sequence == sequence)
            .ok_or(CheckpointError::NotFound { run_id })?;
        inner.read(record)
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        Ok(self.lock().records(run_id)?.iter().map(entry).collect())
    }

    async fn delete(&self, run_id: RunId, policy: CleanupPolicy) -> Result<usize, CheckpointError> {
        let mut inner = self.lock();
        let entries: Vec<CheckpointEntry> = inner.records(run_id)?.iter().map(entry).collect();
        let doomed: BTreeSet<u32> = entries_to_delete(&entries, policy)
            .into_iter()
            .map(|e| e.sequence)
            .collect();
        if let Some(records) = inner.runs.get_mut(&run_id) {
            records.retain(|r| !doomed.contains(&r.sequence));
            if records.is_empty() {
                inner.runs.remove(&run_id);
            }
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn corrupted_record_only_blocks_itself() {
        let store = MemoryCheckpointStore::new();
        let run_id = RunId::new_random();
        let other = RunId::new_random();
        let snapshot = RunSnapshot::new("x");
        store.save(run_id, Stage::Interview, &snapshot).await.unwrap();
        store.save(run_id, Stage::Complexity, &snapshot).await.unwrap();
        store.save(other, Stage::Interview, &snapshot).await.unwrap();

        store.corrupt(run_id, 2);
        assert!(matches!(
            store.load_latest(run_id).await,
            Err(CheckpointError::Corrupted { sequence: 2, .. })
        ));
        assert_eq!(store.load(run_id, 1).await.unwrap().stage, Stage::Interview);
        assert!(store.load_latest(other).await.is_ok());
    }

    #[tokio::test]
    async fn delete_all_forgets_run() {
        let store = MemoryCheckpointStore::new();
        let run_id = RunId::new_random();
        store.save(run_id, Stage::Interview, &RunSnapshot::new("x")).await.unwrap();
        assert_eq!(store.delete(run_id, CleanupPolicy::All).await.unwrap(), 1);
        assert!(store.runs().is_empty());
        assert_eq!(
            store.list(run_id).await.unwrap_err(),
            CheckpointError::NotFound { run_id }
        );
    }
}
