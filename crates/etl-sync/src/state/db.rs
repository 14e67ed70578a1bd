//! Database-backed state storage for sync runs.
//!
//! Stores run state in PostgreSQL tables within the configured schema
//! (`_etl_sync` by default):
//! - Checkpoint updates are single statements
//! - Execution logs are sealed with a guarded UPDATE
//! - History is queryable by job and execution id

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use tracing::debug;
use uuid::Uuid;

use super::{
    BucketChecksum, CheckpointUpdate, ExecutionLog, ExecutionSeal, SnapshotKey, StateBackend,
    SyncCheckpoint, TableStructureSnapshot, ValidationLog,
};
use crate::core::identifier::quote_ansi;
use crate::error::{Result, SyncError};

fn store_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Store(e.to_string())
}

/// PostgreSQL state backend.
pub struct PgStateBackend {
    pool: Pool,
    schema: String,
}

impl PgStateBackend {
    /// Create a backend writing to `schema`.
    pub fn new(pool: Pool, schema: &str) -> Result<Self> {
        Ok(Self {
            pool,
            schema: quote_ansi(schema)?,
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client> {
        self.pool.get().await.map_err(store_err)
    }
}

const CHECKPOINT_COLUMNS: &str = "job_id, last_incremental_value, last_sync_time, \
     source_row_count, target_row_count, applied_bucket_count, skipped_bucket_count, \
     validation_status, last_execution_log_id, updated_at";

const EXECUTION_COLUMNS: &str = "id, job_id, status, started_at, finished_at, \
     extracted_rows, loaded_rows, repaired_rows, failed_rows, duration_ms, error_message, detail";

const BUCKET_COLUMNS: &str = "execution_log_id, job_id, bucket_number, boundary_start, \
     boundary_end, source_row_count, target_row_count, source_checksum, target_checksum, \
     retry_count, retry_success, needs_sync, skip_reason, compared_at, last_retry_time";

const VALIDATION_COLUMNS: &str = "execution_log_id, job_id, source_total_rows, \
     target_total_rows, source_total_checksum, target_total_checksum, bucket_count, \
     mismatch_count, status, message, created_at";

const SNAPSHOT_COLUMNS: &str = "job_id, side, datasource, schema_name, table_name, \
     column_count, primary_key_columns, structure_digest, snapshot_time";

fn checkpoint_from_row(row: &Row) -> Result<SyncCheckpoint> {
    Ok(SyncCheckpoint {
        job_id: row.get(0),
        last_incremental_value: row.get(1),
        last_sync_time: row.get(2),
        source_row_count: row.get(3),
        target_row_count: row.get(4),
        applied_bucket_count: row.get(5),
        skipped_bucket_count: row.get(6),
        validation_status: row.get::<_, String>(7).parse()?,
        last_execution_log_id: row.get(8),
        updated_at: row.get(9),
    })
}

fn execution_from_row(row: &Row) -> Result<ExecutionLog> {
    Ok(ExecutionLog {
        id: row.get(0),
        job_id: row.get(1),
        status: row.get::<_, String>(2).parse()?,
        started_at: row.get(3),
        finished_at: row.get(4),
        extracted_rows: row.get(5),
        loaded_rows: row.get(6),
        repaired_rows: row.get(7),
        failed_rows: row.get(8),
        duration_ms: row.get(9),
        error_message: row.get(10),
        detail: row
            .get::<_, Option<serde_json::Value>>(11)
            .unwrap_or(serde_json::Value::Null),
    })
}

fn bucket_from_row(row: &Row) -> Result<BucketChecksum> {
    Ok(BucketChecksum {
        execution_log_id: row.get(0),
        job_id: row.get(1),
        bucket_number: row.get(2),
        boundary_start: row.get(3),
        boundary_end: row.get(4),
        source_row_count: row.get(5),
        target_row_count: row.get(6),
        source_checksum: row.get(7),
        target_checksum: row.get(8),
        retry_count: row.get(9),
        retry_success: row.get(10),
        needs_sync: row.get(11),
        skip_reason: row
            .get::<_, Option<String>>(12)
            .map(|s| s.parse())
            .transpose()?,
        compared_at: row.get(13),
        last_retry_time: row.get(14),
    })
}

fn validation_from_row(row: &Row) -> Result<ValidationLog> {
    Ok(ValidationLog {
        execution_log_id: row.get(0),
        job_id: row.get(1),
        source_total_rows: row.get(2),
        target_total_rows: row.get(3),
        source_total_checksum: row.get(4),
        target_total_checksum: row.get(5),
        bucket_count: row.get(6),
        mismatch_count: row.get(7),
        status: row.get::<_, String>(8).parse()?,
        message: row.get(9),
        created_at: row.get(10),
    })
}

fn snapshot_from_row(row: &Row) -> Result<TableStructureSnapshot> {
    Ok(TableStructureSnapshot {
        job_id: row.get(0),
        side: row.get::<_, String>(1).parse()?,
        datasource: row.get(2),
        schema: row.get(3),
        table_name: row.get(4),
        column_count: row.get(5),
        primary_key_columns: row.get(6),
        structure_digest: row.get(7),
        snapshot_time: row.get(8),
    })
}

#[async_trait]
impl StateBackend for PgStateBackend {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.client().await?;
        let s = &self.schema;

        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {s}"),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.sync_checkpoint (
                    job_id TEXT PRIMARY KEY,
                    last_incremental_value TEXT,
                    last_sync_time TIMESTAMPTZ,
                    source_row_count BIGINT NOT NULL DEFAULT 0,
                    target_row_count BIGINT NOT NULL DEFAULT 0,
                    applied_bucket_count BIGINT NOT NULL DEFAULT 0,
                    skipped_bucket_count BIGINT NOT NULL DEFAULT 0,
                    validation_status TEXT NOT NULL
                        CHECK (validation_status IN ('INIT', 'SUCCESS', 'PARTIAL_SUCCESS', 'FAILED')),
                    last_execution_log_id UUID,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.execution_log (
                    id UUID PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    status TEXT NOT NULL
                        CHECK (status IN ('RUNNING', 'SUCCESS', 'PARTIAL_SUCCESS', 'FAILED')),
                    started_at TIMESTAMPTZ NOT NULL,
                    finished_at TIMESTAMPTZ,
                    extracted_rows BIGINT NOT NULL DEFAULT 0,
                    loaded_rows BIGINT NOT NULL DEFAULT 0,
                    repaired_rows BIGINT NOT NULL DEFAULT 0,
                    failed_rows BIGINT NOT NULL DEFAULT 0,
                    duration_ms BIGINT,
                    error_message TEXT,
                    detail JSONB
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_execution_log_job
                    ON {s}.execution_log(job_id, started_at DESC)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.bucket_checksum (
                    execution_log_id UUID NOT NULL REFERENCES {s}.execution_log(id) ON DELETE CASCADE,
                    job_id TEXT NOT NULL,
                    bucket_number INT NOT NULL,
                    boundary_start TEXT NOT NULL,
                    boundary_end TEXT,
                    source_row_count BIGINT NOT NULL,
                    target_row_count BIGINT NOT NULL,
                    source_checksum TEXT NOT NULL,
                    target_checksum TEXT NOT NULL,
                    retry_count INT NOT NULL DEFAULT 0,
                    retry_success BOOLEAN NOT NULL DEFAULT FALSE,
                    needs_sync BOOLEAN NOT NULL DEFAULT FALSE,
                    skip_reason TEXT,
                    compared_at TIMESTAMPTZ NOT NULL,
                    last_retry_time TIMESTAMPTZ,
                    PRIMARY KEY (execution_log_id, bucket_number)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.validation_log (
                    execution_log_id UUID PRIMARY KEY REFERENCES {s}.execution_log(id) ON DELETE CASCADE,
                    job_id TEXT NOT NULL,
                    source_total_rows BIGINT NOT NULL,
                    target_total_rows BIGINT NOT NULL,
                    source_total_checksum TEXT NOT NULL,
                    target_total_checksum TEXT NOT NULL,
                    bucket_count INT NOT NULL,
                    mismatch_count INT NOT NULL,
                    status TEXT NOT NULL,
                    message TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.table_structure_snapshot (
                    id BIGSERIAL PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    side TEXT NOT NULL CHECK (side IN ('SOURCE', 'TARGET')),
                    datasource TEXT NOT NULL,
                    schema_name TEXT,
                    table_name TEXT NOT NULL,
                    column_count INT NOT NULL,
                    primary_key_columns TEXT[] NOT NULL,
                    structure_digest TEXT NOT NULL,
                    snapshot_time TIMESTAMPTZ NOT NULL
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_snapshot_latest
                    ON {s}.table_structure_snapshot(job_id, side, datasource, table_name, snapshot_time DESC)"
            ),
        ];

        for statement in &statements {
            conn.execute(statement.as_str(), &[]).await.map_err(store_err)?;
        }
        debug!("State schema {} ready", self.schema);
        Ok(())
    }

    async fn get_or_create_checkpoint(&self, job_id: &str) -> Result<SyncCheckpoint> {
        let conn = self.client().await?;
        conn.execute(
            &format!(
                "INSERT INTO {}.sync_checkpoint (job_id, validation_status)
                 VALUES ($1, 'INIT')
                 ON CONFLICT (job_id) DO NOTHING",
                self.schema
            ),
            &[&job_id],
        )
        .await
        .map_err(store_err)?;

        let row = conn
            .query_one(
                &format!(
                    "SELECT {} FROM {}.sync_checkpoint WHERE job_id = $1",
                    CHECKPOINT_COLUMNS, self.schema
                ),
                &[&job_id],
            )
            .await
            .map_err(store_err)?;
        checkpoint_from_row(&row)
    }

    async fn get_checkpoint(&self, job_id: &str) -> Result<Option<SyncCheckpoint>> {
        let conn = self.client().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {}.sync_checkpoint WHERE job_id = $1",
                    CHECKPOINT_COLUMNS, self.schema
                ),
                &[&job_id],
            )
            .await
            .map_err(store_err)?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn update_checkpoint_after_execution(&self, update: &CheckpointUpdate) -> Result<()> {
        let conn = self.client().await?;
        conn.execute(
            &format!(
                "INSERT INTO {}.sync_checkpoint ({})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
                 ON CONFLICT (job_id) DO UPDATE SET
                    last_incremental_value = EXCLUDED.last_incremental_value,
                    last_sync_time = EXCLUDED.last_sync_time,
                    source_row_count = EXCLUDED.source_row_count,
                    target_row_count = EXCLUDED.target_row_count,
                    applied_bucket_count = EXCLUDED.applied_bucket_count,
                    skipped_bucket_count = EXCLUDED.skipped_bucket_count,
                    validation_status = EXCLUDED.validation_status,
                    last_execution_log_id = EXCLUDED.last_execution_log_id,
                    updated_at = NOW()",
                self.schema, CHECKPOINT_COLUMNS
            ),
            &[
                &update.job_id,
                &update.last_incremental_value,
                &update.last_sync_time,
                &update.source_row_count,
                &update.target_row_count,
                &update.applied_bucket_count,
                &update.skipped_bucket_count,
                &update.validation_status.as_str(),
                &update.execution_log_id,
            ],
        )
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn start_execution(&self, log: &ExecutionLog) -> Result<()> {
        let conn = self.client().await?;
        conn.execute(
            &format!(
                "INSERT INTO {}.execution_log ({})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                self.schema, EXECUTION_COLUMNS
            ),
            &[
                &log.id,
                &log.job_id,
                &log.status.as_str(),
                &log.started_at,
                &log.finished_at,
                &log.extracted_rows,
                &log.loaded_rows,
                &log.repaired_rows,
                &log.failed_rows,
                &log.duration_ms,
                &log.error_message,
                &log.detail,
            ],
        )
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn seal_execution(&self, id: Uuid, seal: &ExecutionSeal) -> Result<()> {
        let conn = self.client().await?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {}.execution_log SET
                        status = $2,
                        finished_at = $3,
                        extracted_rows = $4,
                        loaded_rows = $5,
                        repaired_rows = $6,
                        failed_rows = $7,
                        duration_ms = $8,
                        error_message = $9,
                        detail = $10
                     WHERE id = $1 AND finished_at IS NULL",
                    self.schema
                ),
                &[
                    &id,
                    &seal.status.as_str(),
                    &seal.finished_at,
                    &seal.extracted_rows,
                    &seal.loaded_rows,
                    &seal.repaired_rows,
                    &seal.failed_rows,
                    &seal.duration_ms,
                    &seal.error_message,
                    &seal.detail,
                ],
            )
            .await
            .map_err(store_err)?;

        if updated == 0 {
            return Err(SyncError::Store(format!(
                "execution log {} is missing or already sealed",
                id
            )));
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionLog>> {
        let conn = self.client().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {}.execution_log WHERE id = $1",
                    EXECUTION_COLUMNS, self.schema
                ),
                &[&id],
            )
            .await
            .map_err(store_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn list_executions(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionLog>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM {}.execution_log
                     WHERE job_id = $1
                     ORDER BY started_at DESC
                     LIMIT $2",
                    EXECUTION_COLUMNS, self.schema
                ),
                &[&job_id, &(limit as i64)],
            )
            .await
            .map_err(store_err)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn save_bucket_checksums(&self, buckets: &[BucketChecksum]) -> Result<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        let mut conn = self.client().await?;
        let tx = conn.transaction().await.map_err(store_err)?;
        let stmt = tx
            .prepare(&format!(
                "INSERT INTO {}.bucket_checksum ({})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
                self.schema, BUCKET_COLUMNS
            ))
            .await
            .map_err(store_err)?;

        for b in buckets {
            let skip_reason = b.skip_reason.map(|r| r.as_str());
            tx.execute(
                &stmt,
                &[
                    &b.execution_log_id,
                    &b.job_id,
                    &b.bucket_number,
                    &b.boundary_start,
                    &b.boundary_end,
                    &b.source_row_count,
                    &b.target_row_count,
                    &b.source_checksum,
                    &b.target_checksum,
                    &b.retry_count,
                    &b.retry_success,
                    &b.needs_sync,
                    &skip_reason,
                    &b.compared_at,
                    &b.last_retry_time,
                ],
            )
            .await
            .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn update_bucket_checksum(&self, b: &BucketChecksum) -> Result<()> {
        let conn = self.client().await?;
        let skip_reason = b.skip_reason.map(|r| r.as_str());
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {}.bucket_checksum SET
                        source_row_count = $3,
                        target_row_count = $4,
                        source_checksum = $5,
                        target_checksum = $6,
                        retry_count = $7,
                        retry_success = $8,
                        needs_sync = $9,
                        skip_reason = $10,
                        compared_at = $11,
                        last_retry_time = $12
                     WHERE execution_log_id = $1 AND bucket_number = $2",
                    self.schema
                ),
                &[
                    &b.execution_log_id,
                    &b.bucket_number,
                    &b.source_row_count,
                    &b.target_row_count,
                    &b.source_checksum,
                    &b.target_checksum,
                    &b.retry_count,
                    &b.retry_success,
                    &b.needs_sync,
                    &skip_reason,
                    &b.compared_at,
                    &b.last_retry_time,
                ],
            )
            .await
            .map_err(store_err)?;

        if updated == 0 {
            return Err(SyncError::Store(format!(
                "bucket {} of execution {} not found",
                b.bucket_number, b.execution_log_id
            )));
        }
        Ok(())
    }

    async fn list_bucket_checksums(&self, execution_id: Uuid) -> Result<Vec<BucketChecksum>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM {}.bucket_checksum
                     WHERE execution_log_id = $1
                     ORDER BY bucket_number",
                    BUCKET_COLUMNS, self.schema
                ),
                &[&execution_id],
            )
            .await
            .map_err(store_err)?;
        rows.iter().map(bucket_from_row).collect()
    }

    async fn save_validation_log(&self, log: &ValidationLog) -> Result<()> {
        let conn = self.client().await?;
        conn.execute(
            &format!(
                "INSERT INTO {}.validation_log ({})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                self.schema, VALIDATION_COLUMNS
            ),
            &[
                &log.execution_log_id,
                &log.job_id,
                &log.source_total_rows,
                &log.target_total_rows,
                &log.source_total_checksum,
                &log.target_total_checksum,
                &log.bucket_count,
                &log.mismatch_count,
                &log.status.as_str(),
                &log.message,
                &log.created_at,
            ],
        )
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_validation_log(&self, execution_id: Uuid) -> Result<Option<ValidationLog>> {
        let conn = self.client().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {}.validation_log WHERE execution_log_id = $1",
                    VALIDATION_COLUMNS, self.schema
                ),
                &[&execution_id],
            )
            .await
            .map_err(store_err)?;
        row.as_ref().map(validation_from_row).transpose()
    }

    async fn save_snapshot(&self, s: &TableStructureSnapshot) -> Result<()> {
        let conn = self.client().await?;
        conn.execute(
            &format!(
                "INSERT INTO {}.table_structure_snapshot ({})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                self.schema, SNAPSHOT_COLUMNS
            ),
            &[
                &s.job_id,
                &s.side.as_str(),
                &s.datasource,
                &s.schema,
                &s.table_name,
                &s.column_count,
                &s.primary_key_columns,
                &s.structure_digest,
                &s.snapshot_time,
            ],
        )
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn latest_snapshot(&self, key: &SnapshotKey) -> Result<Option<TableStructureSnapshot>> {
        let conn = self.client().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {}.table_structure_snapshot
                     WHERE job_id = $1
                       AND side = $2
                       AND datasource = $3
                       AND schema_name IS NOT DISTINCT FROM $4
                       AND table_name = $5
                     ORDER BY snapshot_time DESC, id DESC
                     LIMIT 1",
                    SNAPSHOT_COLUMNS, self.schema
                ),
                &[
                    &key.job_id,
                    &key.side.as_str(),
                    &key.datasource,
                    &key.schema,
                    &key.table,
                ],
            )
            .await
            .map_err(store_err)?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
