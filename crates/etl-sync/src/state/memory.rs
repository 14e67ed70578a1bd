//! In-process state storage.
//!
//! Keeps everything behind one async mutex; state is lost on exit.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BucketChecksum, CheckpointUpdate, ExecutionLog, ExecutionSeal, SnapshotKey, StateBackend,
    SyncCheckpoint, TableStructureSnapshot, ValidationLog,
};
use crate::error::{Result, SyncError};

#[derive(Default)]
struct Inner {
    checkpoints: HashMap<String, SyncCheckpoint>,
    executions: Vec<ExecutionLog>,
    buckets: Vec<BucketChecksum>,
    validations: Vec<ValidationLog>,
    snapshots: Vec<TableStructureSnapshot>,
}

/// State backend holding records in memory.
#[derive(Default)]
pub struct MemoryStateBackend {
    inner: Mutex<Inner>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn get_or_create_checkpoint(&self, job_id: &str) -> Result<SyncCheckpoint> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .checkpoints
            .entry(job_id.to_string())
            .or_insert_with(|| SyncCheckpoint::new(job_id))
            .clone())
    }

    async fn get_checkpoint(&self, job_id: &str) -> Result<Option<SyncCheckpoint>> {
        Ok(self.inner.lock().await.checkpoints.get(job_id).cloned())
    }

    async fn update_checkpoint_after_execution(&self, update: &CheckpointUpdate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .checkpoints
            .entry(update.job_id.clone())
            .or_insert_with(|| SyncCheckpoint::new(&update.job_id))
            .apply(update);
        Ok(())
    }

    async fn start_execution(&self, log: &ExecutionLog) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.executions.iter().any(|e| e.id == log.id) {
            return Err(SyncError::Store(format!(
                "execution log {} already exists",
                log.id
            )));
        }
        inner.executions.push(log.clone());
        Ok(())
    }

    async fn seal_execution(&self, id: Uuid, seal: &ExecutionSeal) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let log = inner
            .executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| SyncError::Store(format!("execution log {} not found", id)))?;
        log.seal(seal)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionLog>> {
        let inner = self.inner.lock().await;
        Ok(inner.executions.iter().find(|e| e.id == id).cloned())
    }

    async fn list_executions(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionLog>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .executions
            .iter()
            .rev()
            .filter(|e| e.job_id == job_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_bucket_checksums(&self, buckets: &[BucketChecksum]) -> Result<()> {
        self.inner.lock().await.buckets.extend_from_slice(buckets);
        Ok(())
    }

    async fn update_bucket_checksum(&self, bucket: &BucketChecksum) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .buckets
            .iter_mut()
            .find(|b| {
                b.execution_log_id == bucket.execution_log_id
                    && b.bucket_number == bucket.bucket_number
            })
            .ok_or_else(|| {
                SyncError::Store(format!(
                    "bucket {} of execution {} not found",
                    bucket.bucket_number, bucket.execution_log_id
                ))
            })?;
        *stored = bucket.clone();
        Ok(())
    }

    async fn list_bucket_checksums(&self, execution_id: Uuid) -> Result<Vec<BucketChecksum>> {
        let inner = self.inner.lock().await;
        let mut buckets: Vec<_> = inner
            .buckets
            .iter()
            .filter(|b| b.execution_log_id == execution_id)
            .cloned()
            .collect();
        buckets.sort_by_key(|b| b.bucket_number);
        Ok(buckets)
    }

    async fn save_validation_log(&self, log: &ValidationLog) -> Result<()> {
        self.inner.lock().await.validations.push(log.clone());
        Ok(())
    }

    async fn get_validation_log(&self, execution_id: Uuid) -> Result<Option<ValidationLog>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .validations
            .iter()
            .rev()
            .find(|v| v.execution_log_id == execution_id)
            .cloned())
    }

    async fn save_snapshot(&self, snapshot: &TableStructureSnapshot) -> Result<()> {
        self.inner.lock().await.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(&self, key: &SnapshotKey) -> Result<Option<TableStructureSnapshot>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .iter()
            .rev()
            .find(|s| &s.key() == key)
            .cloned())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExecutionStatus, SnapshotSide, ValidationStatus};
    use chrono::Utc;

    fn seal(status: ExecutionStatus) -> ExecutionSeal {
        ExecutionSeal {
            status,
            finished_at: Utc::now(),
            extracted_rows: 0,
            loaded_rows: 0,
            repaired_rows: 0,
            failed_rows: 0,
            duration_ms: 1,
            error_message: None,
            detail: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_checkpoint_created_lazily() {
        let store = MemoryStateBackend::new();
        assert!(store.get_checkpoint("j").await.unwrap().is_none());
        let cp = store.get_or_create_checkpoint("j").await.unwrap();
        assert_eq!(cp.validation_status, ValidationStatus::Init);
        assert_eq!(cp.last_incremental_value, None);
        assert!(store.get_checkpoint("j").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_execution_seal_and_listing() {
        let store = MemoryStateBackend::new();
        let first = ExecutionLog::start("j");
        let second = ExecutionLog::start("j");
        store.start_execution(&first).await.unwrap();
        store.start_execution(&second).await.unwrap();
        store.start_execution(&ExecutionLog::start("other")).await.unwrap();

        store
            .seal_execution(first.id, &seal(ExecutionStatus::Success))
            .await
            .unwrap();
        assert!(store
            .seal_execution(first.id, &seal(ExecutionStatus::Failed))
            .await
            .is_err());

        let listed = store.list_executions("j", 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].status, ExecutionStatus::Success);
        assert_eq!(store.list_executions("j", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_snapshot_per_key() {
        let store = MemoryStateBackend::new();
        let snapshot = |digest: &str, side| TableStructureSnapshot {
            job_id: "j".into(),
            side,
            datasource: "src".into(),
            schema: None,
            table_name: "t".into(),
            column_count: 2,
            primary_key_columns: vec!["id".into()],
            structure_digest: digest.into(),
            snapshot_time: Utc::now(),
        };
        store.save_snapshot(&snapshot("a", SnapshotSide::Source)).await.unwrap();
        store.save_snapshot(&snapshot("b", SnapshotSide::Source)).await.unwrap();
        store.save_snapshot(&snapshot("c", SnapshotSide::Target)).await.unwrap();

        let latest = store
            .latest_snapshot(&snapshot("", SnapshotSide::Source).key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.structure_digest, "b");
    }
}
