//! State backend trait for run state storage.
//!
//! The [`StateBackend`] trait defines the interface for persisting run state.
//! Implementations:
//!
//! - **PostgreSQL**: `PgStateBackend` in `db.rs`
//! - **Memory**: `MemoryStateBackend` in `memory.rs`, for tests and dry runs
//!
//! # Design Pattern
//!
//! This uses the Strategy pattern to decouple state storage from the orchestrator.
//! The orchestrator works with `Arc<dyn StateBackend>` without knowing the concrete type.

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    BucketChecksum, CheckpointUpdate, ExecutionLog, ExecutionSeal, SnapshotKey, SyncCheckpoint,
    TableStructureSnapshot, ValidationLog,
};
use crate::error::Result;

/// Trait for run state persistence backends.
///
/// Implementations must be `Send + Sync` to allow sharing across job tasks.
/// Every failure is reported as `SyncError::Store`.
///
/// # Example
///
/// ```rust,ignore
/// let backend: Arc<dyn StateBackend> = Arc::new(PgStateBackend::new(pool, "_etl_sync"));
/// backend.init_schema().await?;
/// let checkpoint = backend.get_or_create_checkpoint("orders").await?;
/// ```
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Create the storage structure. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Load a job's checkpoint, creating the zero state on first use.
    async fn get_or_create_checkpoint(&self, job_id: &str) -> Result<SyncCheckpoint>;

    /// Load a job's checkpoint without creating it.
    async fn get_checkpoint(&self, job_id: &str) -> Result<Option<SyncCheckpoint>>;

    /// Replace all checkpoint fields in one atomic write.
    async fn update_checkpoint_after_execution(&self, update: &CheckpointUpdate) -> Result<()>;

    /// Record a RUNNING execution log.
    async fn start_execution(&self, log: &ExecutionLog) -> Result<()>;

    /// Seal an execution log. Sealing twice is an error.
    async fn seal_execution(&self, id: Uuid, seal: &ExecutionSeal) -> Result<()>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionLog>>;

    /// Most recent executions of a job, newest first.
    async fn list_executions(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionLog>>;

    /// Insert the scored buckets of a run.
    async fn save_bucket_checksums(&self, buckets: &[BucketChecksum]) -> Result<()>;

    /// Update one bucket in place after repair.
    async fn update_bucket_checksum(&self, bucket: &BucketChecksum) -> Result<()>;

    /// Buckets of a run in bucket order.
    async fn list_bucket_checksums(&self, execution_id: Uuid) -> Result<Vec<BucketChecksum>>;

    async fn save_validation_log(&self, log: &ValidationLog) -> Result<()>;

    async fn get_validation_log(&self, execution_id: Uuid) -> Result<Option<ValidationLog>>;

    async fn save_snapshot(&self, snapshot: &TableStructureSnapshot) -> Result<()>;

    /// Latest snapshot for the given table, if any.
    async fn latest_snapshot(&self, key: &SnapshotKey) -> Result<Option<TableStructureSnapshot>>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}
