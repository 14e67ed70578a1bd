//! Persisted run state: checkpoints, execution and validation logs, bucket
//! checksums and table structure snapshots.
//!
//! Only the orchestrator writes these records. The [`StateBackend`] trait is
//! also the read-only query surface used by the CLI for status reporting.

mod backend;
mod db;
mod memory;

pub use backend::StateBackend;
pub use db::PgStateBackend;
pub use memory::MemoryStateBackend;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            /// Stored text form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(SyncError::Store(format!(
                        "invalid {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum!(
    /// Outcome of the last validation of a job.
    ValidationStatus {
        Init => "INIT",
        Success => "SUCCESS",
        PartialSuccess => "PARTIAL_SUCCESS",
        Failed => "FAILED",
    }
);

status_enum!(
    /// Lifecycle of one run.
    ExecutionStatus {
        Running => "RUNNING",
        Success => "SUCCESS",
        PartialSuccess => "PARTIAL_SUCCESS",
        Failed => "FAILED",
    }
);

status_enum!(
    /// Why a bucket ended up the way it did after reconciliation.
    SkipReason {
        TypeMismatch => "TYPE_MISMATCH",
        NonDeterministicOrder => "NON_DETERMINISTIC_ORDER",
        OrphanedTargetRows => "ORPHANED_TARGET_ROWS",
        RetryExhausted => "RETRY_EXHAUSTED",
        CompareError => "COMPARE_ERROR",
        RetryRecovered => "RETRY_RECOVERED",
    }
);

status_enum!(
    /// Which table of a job a snapshot describes.
    SnapshotSide {
        Source => "SOURCE",
        Target => "TARGET",
    }
);

impl From<ExecutionStatus> for ValidationStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Running => ValidationStatus::Init,
            ExecutionStatus::Success => ValidationStatus::Success,
            ExecutionStatus::PartialSuccess => ValidationStatus::PartialSuccess,
            ExecutionStatus::Failed => ValidationStatus::Failed,
        }
    }
}

/// Per-job watermark and last outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub job_id: String,
    /// Canonical text of the highest incremental value synchronized.
    pub last_incremental_value: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub source_row_count: i64,
    pub target_row_count: i64,
    pub applied_bucket_count: i64,
    pub skipped_bucket_count: i64,
    pub validation_status: ValidationStatus,
    pub last_execution_log_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    /// Zero-state checkpoint for a job that never ran.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            last_incremental_value: None,
            last_sync_time: None,
            source_row_count: 0,
            target_row_count: 0,
            applied_bucket_count: 0,
            skipped_bucket_count: 0,
            validation_status: ValidationStatus::Init,
            last_execution_log_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Apply an update, replacing every tracked field.
    pub fn apply(&mut self, update: &CheckpointUpdate) {
        self.last_incremental_value = update.last_incremental_value.clone();
        self.last_sync_time = Some(update.last_sync_time);
        self.source_row_count = update.source_row_count;
        self.target_row_count = update.target_row_count;
        self.applied_bucket_count = update.applied_bucket_count;
        self.skipped_bucket_count = update.skipped_bucket_count;
        self.validation_status = update.validation_status;
        self.last_execution_log_id = Some(update.execution_log_id);
        self.updated_at = Utc::now();
    }
}

/// All checkpoint fields written together after a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointUpdate {
    pub job_id: String,
    pub last_incremental_value: Option<String>,
    pub last_sync_time: DateTime<Utc>,
    pub source_row_count: i64,
    pub target_row_count: i64,
    pub applied_bucket_count: i64,
    pub skipped_bucket_count: i64,
    pub validation_status: ValidationStatus,
    pub execution_log_id: Uuid,
}

/// One run of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub job_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub extracted_rows: i64,
    pub loaded_rows: i64,
    pub repaired_rows: i64,
    pub failed_rows: i64,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub detail: serde_json::Value,
}

impl ExecutionLog {
    /// A new RUNNING log with a fresh id.
    pub fn start(job_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            extracted_rows: 0,
            loaded_rows: 0,
            repaired_rows: 0,
            failed_rows: 0,
            duration_ms: None,
            error_message: None,
            detail: serde_json::Value::Null,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Apply a seal. Fails if the log is already sealed.
    pub fn seal(&mut self, seal: &ExecutionSeal) -> Result<()> {
        if self.is_sealed() {
            return Err(SyncError::Store(format!(
                "execution log {} is already sealed",
                self.id
            )));
        }
        self.status = seal.status;
        self.finished_at = Some(seal.finished_at);
        self.extracted_rows = seal.extracted_rows;
        self.loaded_rows = seal.loaded_rows;
        self.repaired_rows = seal.repaired_rows;
        self.failed_rows = seal.failed_rows;
        self.duration_ms = Some(seal.duration_ms);
        self.error_message = seal.error_message.clone();
        self.detail = seal.detail.clone();
        Ok(())
    }
}

/// Terminal fields written when a run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSeal {
    pub status: ExecutionStatus,
    pub finished_at: DateTime<Utc>,
    pub extracted_rows: i64,
    pub loaded_rows: i64,
    pub repaired_rows: i64,
    pub failed_rows: i64,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub detail: serde_json::Value,
}

/// Comparison result for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketChecksum {
    pub execution_log_id: Uuid,
    pub job_id: String,
    pub bucket_number: i32,
    pub boundary_start: String,
    /// `None` when the bucket is unbounded above.
    pub boundary_end: Option<String>,
    pub source_row_count: i64,
    pub target_row_count: i64,
    pub source_checksum: String,
    pub target_checksum: String,
    pub retry_count: i32,
    pub retry_success: bool,
    pub needs_sync: bool,
    pub skip_reason: Option<SkipReason>,
    pub compared_at: DateTime<Utc>,
    pub last_retry_time: Option<DateTime<Utc>>,
}

impl BucketChecksum {
    /// Counts and checksums agree.
    pub fn is_matched(&self) -> bool {
        self.source_row_count == self.target_row_count
            && self.source_checksum == self.target_checksum
    }
}

/// Aggregate validation result of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationLog {
    pub execution_log_id: Uuid,
    pub job_id: String,
    pub source_total_rows: i64,
    pub target_total_rows: i64,
    pub source_total_checksum: String,
    pub target_total_checksum: String,
    pub bucket_count: i32,
    pub mismatch_count: i32,
    pub status: ValidationStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Identifies the table a snapshot belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub job_id: String,
    pub side: SnapshotSide,
    pub datasource: String,
    pub schema: Option<String>,
    pub table: String,
}

/// Structure digest of one table at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStructureSnapshot {
    pub job_id: String,
    pub side: SnapshotSide,
    pub datasource: String,
    pub schema: Option<String>,
    pub table_name: String,
    pub column_count: i32,
    pub primary_key_columns: Vec<String>,
    pub structure_digest: String,
    pub snapshot_time: DateTime<Utc>,
}

impl TableStructureSnapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            job_id: self.job_id.clone(),
            side: self.side,
            datasource: self.datasource.clone(),
            schema: self.schema.clone(),
            table: self.table_name.clone(),
        }
    }
}
