//! Reconciliation orchestrator - runs one job through its lifecycle.
//!
//! ```text
//! PENDING → EXTRACTING → BUCKETING → RECONCILING → CHECKPOINTING → SUCCESS | PARTIAL_SUCCESS | FAILED
//! ```
//!
//! Run failures are recorded in the execution log and returned as a FAILED
//! [`RunOutcome`]. Only a rejected start, an unknown job or a state backend
//! failure surface as `Err`; after a state backend failure the log is still
//! sealed FAILED when the backend accepts the write.

mod guard;

pub use guard::{ActiveJobs, JobGuard};

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, StoreBackendKind, SyncJob, SyncMode};
use crate::core::catalog::DialectRegistry;
use crate::core::schema::{KeyKind, TableSchemaMetadata};
use crate::core::traits::{IncrementalBound, PageRequest};
use crate::core::value::{Row, SqlValue, TypeFamily};
use crate::dialect::DialectResolver;
use crate::drivers::{DatasourceRegistry, PostgresDatasource};
use crate::error::{Result, SyncError};
use crate::mapping::ColumnProjection;
use crate::metadata::{
    DatabaseMetadataService, InformationSchemaMetadataService, TableMetadataInspector,
};
use crate::state::{
    CheckpointUpdate, ExecutionLog, ExecutionSeal, ExecutionStatus, MemoryStateBackend,
    PgStateBackend, SnapshotSide, StateBackend, SyncCheckpoint, TableStructureSnapshot,
    ValidationLog, ValidationStatus,
};
use crate::verify::{bucket_key, BucketChecksumEngine, BucketReport, BucketSettings, TableSide};

/// Lifecycle phase of a run, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Pending = 0,
    Extracting = 1,
    Bucketing = 2,
    Reconciling = 3,
    Checkpointing = 4,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunPhase::Pending => "PENDING",
            RunPhase::Extracting => "EXTRACTING",
            RunPhase::Bucketing => "BUCKETING",
            RunPhase::Reconciling => "RECONCILING",
            RunPhase::Checkpointing => "CHECKPOINTING",
        })
    }
}

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub execution_id: Uuid,
    pub job_id: String,
    pub status: ExecutionStatus,
    pub validation_status: ValidationStatus,
    pub extracted_rows: i64,
    pub loaded_rows: i64,
    pub repaired_rows: i64,
    pub failed_rows: i64,
    pub bucket_count: usize,
    /// Buckets that differed before repair.
    pub initial_mismatches: usize,
    /// Buckets still differing after repair.
    pub needs_sync: usize,
    /// Watermark stored by this run, if any.
    pub watermark: Option<String>,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// Mutable state of one run.
struct RunContext {
    job: SyncJob,
    log: ExecutionLog,
    checkpoint: SyncCheckpoint,
    phase: RunPhase,
    watermark_family: Option<TypeFamily>,
    previous_watermark: Option<SqlValue>,
    observed_watermark: Option<SqlValue>,
    extracted_rows: i64,
    loaded_rows: i64,
    failed_rows: i64,
    drift: Vec<String>,
    dialects: Option<(String, String)>,
    report: Option<BucketReport>,
    validation_error: Option<String>,
}

impl RunContext {
    fn new(job: SyncJob, log: ExecutionLog, checkpoint: SyncCheckpoint) -> Self {
        Self {
            job,
            log,
            checkpoint,
            phase: RunPhase::Pending,
            watermark_family: None,
            previous_watermark: None,
            observed_watermark: None,
            extracted_rows: 0,
            loaded_rows: 0,
            failed_rows: 0,
            drift: Vec::new(),
            dialects: None,
            report: None,
            validation_error: None,
        }
    }

    fn transition(&mut self, next: RunPhase) {
        info!(
            "Phase {}: {} (job {}, run {}, was {})",
            next as u8, next, self.job.id, self.log.id, self.phase
        );
        self.phase = next;
    }

    fn observe(&mut self, value: &SqlValue) {
        if value.is_null() {
            return;
        }
        let higher = match &self.observed_watermark {
            None => true,
            Some(current) => value.compare(current) == Some(Ordering::Greater),
        };
        if higher {
            self.observed_watermark = Some(value.clone());
        }
    }

    /// `max(previous, observed)` as stored text. Never moves backwards.
    fn next_watermark(&self) -> Option<String> {
        let Some(observed) = &self.observed_watermark else {
            return self.checkpoint.last_incremental_value.clone();
        };
        match &self.previous_watermark {
            Some(previous) if observed.compare(previous) != Some(Ordering::Greater) => {
                self.checkpoint.last_incremental_value.clone()
            }
            _ => observed.canonical_text(),
        }
    }
}

/// Everything phase 1 resolves for the later phases.
struct PreparedRun {
    source: TableSide,
    target: TableSide,
    projection: Arc<ColumnProjection>,
    key_kind: KeyKind,
    incremental_column: Option<String>,
}

/// Runs sync jobs against the configured datasources and state store.
pub struct ReconciliationOrchestrator {
    config: Config,
    registry: DatasourceRegistry,
    resolver: DialectResolver,
    inspector: TableMetadataInspector,
    store: Arc<dyn StateBackend>,
    active: ActiveJobs,
    cancel: CancellationToken,
}

impl ReconciliationOrchestrator {
    pub fn new(
        config: Config,
        registry: DatasourceRegistry,
        resolver: DialectResolver,
        metadata: Arc<dyn DatabaseMetadataService>,
        store: Arc<dyn StateBackend>,
    ) -> Self {
        Self {
            config,
            registry,
            resolver,
            inspector: TableMetadataInspector::new(metadata),
            store,
            active: ActiveJobs::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Connect every configured datasource and open the state store.
    pub async fn connect(config: Config) -> Result<Self> {
        let registry = DatasourceRegistry::connect(&config.datasources).await?;
        let resolver = DialectResolver::new(Arc::new(DialectRegistry::with_builtins()));
        let metadata: Arc<dyn DatabaseMetadataService> = Arc::new(
            InformationSchemaMetadataService::new(registry.clone(), resolver.clone()),
        );
        let store = open_store(&config).await?;
        Ok(Self::new(config, registry, resolver, metadata, store))
    }

    /// Fail active and future runs with `Cancelled` once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read access to run history.
    pub fn store(&self) -> &Arc<dyn StateBackend> {
        &self.store
    }

    /// Ping every registered datasource.
    pub async fn health_check(&self) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for code in self.registry.codes() {
            let result = match self.registry.get(&code) {
                Ok(ds) => ds.ping().await,
                Err(e) => Err(e),
            };
            results.push((code, result));
        }
        results
    }

    /// Run every configured job concurrently, one task per job.
    pub async fn execute_all(self: &Arc<Self>) -> Vec<(String, Result<RunOutcome>)> {
        let handles: Vec<_> = self
            .config
            .jobs
            .iter()
            .map(|job| {
                let this = Arc::clone(self);
                let id = job.id.clone();
                (job.id.clone(), tokio::spawn(async move { this.execute(&id).await }))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(SyncError::Query(format!("job task failed: {}", e))));
            results.push((id, result));
        }
        results
    }

    /// Run one configured job by id.
    pub async fn execute(&self, job_id: &str) -> Result<RunOutcome> {
        let job = self
            .config
            .job(job_id)
            .cloned()
            .ok_or_else(|| SyncError::Config(format!("job '{}' is not defined", job_id)))?;
        self.execute_job(job).await
    }

    /// Run one job definition against the registered datasources.
    pub async fn execute_job(&self, job: SyncJob) -> Result<RunOutcome> {
        let _guard = if job.concurrent_allowed {
            None
        } else {
            Some(self.active.acquire(&job.id)?)
        };

        let started = Instant::now();
        let log = ExecutionLog::start(&job.id);
        self.store.start_execution(&log).await?;
        let checkpoint = self.store.get_or_create_checkpoint(&job.id).await?;
        info!(
            "Starting run {} of job {} ({:?}, watermark {:?})",
            log.id,
            job.display_name(),
            job.sync_mode,
            checkpoint.last_incremental_value
        );

        let mut ctx = RunContext::new(job, log, checkpoint);
        let result = match self.run_guarded(&mut ctx).await {
            Err(e @ SyncError::Store(_)) => {
                self.seal_after_store_failure(&ctx, &e, started).await;
                return Err(e);
            }
            other => other,
        };
        match self.finish(&mut ctx, result, started).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.seal_after_store_failure(&ctx, &e, started).await;
                Err(e)
            }
        }
    }

    /// Best-effort FAILED seal so the log does not stay RUNNING.
    async fn seal_after_store_failure(&self, ctx: &RunContext, cause: &SyncError, started: Instant) {
        error!(
            "Run {} of job {} aborted by a state store failure: {}",
            ctx.log.id, ctx.job.id, cause
        );
        let seal = self.seal(
            ctx,
            ctx.phase,
            ExecutionStatus::Failed,
            ValidationStatus::Failed,
            Some(cause.to_string()),
            ctx.checkpoint.last_incremental_value.clone(),
            started,
        );
        if let Err(e) = self.store.seal_execution(ctx.log.id, &seal).await {
            error!("Run {} could not be sealed: {}", ctx.log.id, e);
        }
    }

    /// Phases 1-4 under the run timeout and cancellation token.
    async fn run_guarded(&self, ctx: &mut RunContext) -> Result<()> {
        let cancel = self.cancel.clone();
        let phases = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SyncError::Cancelled),
                result = self.run_phases(ctx) => result,
            }
        };
        match self.config.sync.run_timeout() {
            Some(limit) => tokio::time::timeout(limit, phases)
                .await
                .unwrap_or_else(|_| Err(SyncError::Timeout(limit.as_secs()))),
            None => phases.await,
        }
    }

    async fn run_phases(&self, ctx: &mut RunContext) -> Result<()> {
        let prepared = self.prepare(ctx).await?;

        ctx.transition(RunPhase::Extracting);
        self.extract(ctx, &prepared).await?;

        ctx.transition(RunPhase::Bucketing);
        let engine = BucketChecksumEngine::new(
            prepared.source.clone(),
            prepared.target.clone(),
            Arc::clone(&prepared.projection),
            prepared.key_kind,
            BucketSettings::new(&self.config.sync, &ctx.job),
        );
        let buckets = match engine.plan().await {
            Ok(buckets) => buckets,
            Err(e) => {
                warn!(
                    "Job {}: bucket validation could not start: {}",
                    ctx.job.id, e
                );
                ctx.validation_error = Some(e.to_string());
                return Ok(());
            }
        };

        ctx.transition(RunPhase::Reconciling);
        let report = engine
            .reconcile(self.store.as_ref(), ctx.log.id, &ctx.job.id, &buckets)
            .await?;
        info!(
            "Job {}: {} bucket(s), {} mismatched, {} recovered, {} need sync",
            ctx.job.id,
            report.bucket_count,
            report.initial_mismatches,
            report.recovered,
            report.needs_sync
        );
        ctx.report = Some(report);
        Ok(())
    }

    /// PENDING: resolve datasources, inspect both tables, plan the projection.
    async fn prepare(&self, ctx: &mut RunContext) -> Result<PreparedRun> {
        let job = ctx.job.clone();
        let source_ds = self.registry.get(&job.source)?;
        let target_ds = self.registry.get(&job.target)?;
        let source_access = Arc::clone(&source_ds).table_access(self.resolver.resolve(source_ds.info())?);
        let target_access = Arc::clone(&target_ds).table_access(self.resolver.resolve(target_ds.info())?);
        ctx.dialects = Some((
            source_access.dialect_name().to_string(),
            target_access.dialect_name().to_string(),
        ));

        let source_meta = self
            .inspector
            .inspect(&job.source, job.source_schema.as_deref(), &job.source_table)
            .await?;
        let target_meta = self
            .inspector
            .inspect(&job.target, job.target_schema.as_deref(), &job.target_table)
            .await?;
        self.record_snapshot(ctx, SnapshotSide::Source, &job.source, &source_meta)
            .await?;
        self.record_snapshot(ctx, SnapshotSide::Target, &job.target, &target_meta)
            .await?;

        let mut projection = ColumnProjection::plan(
            &job.column_mappings,
            &source_meta,
            &target_meta,
            self.config.sync.auto_add_columns,
        )?;
        for mismatch in projection.type_mismatches() {
            warn!("Job {}: incompatible column types {}", job.id, mismatch);
        }

        let incremental_column = match (job.sync_mode, &job.incremental_column) {
            (SyncMode::Incremental, Some(name)) => {
                let column = source_meta.column(name).ok_or_else(|| {
                    SyncError::SchemaDrift(format!(
                        "incremental column {} no longer exists in {}",
                        name, source_meta.table
                    ))
                })?;
                ctx.watermark_family = Some(column.family());
                projection.ensure_source_column(&column.name);
                Some(column.name.clone())
            }
            _ => None,
        };

        let (source_key, key_kind) = bucket_key(&source_meta)?;
        let target_key = projection.primary_key().first().cloned().ok_or_else(|| {
            SyncError::unsupported_key(target_meta.table.to_string(), "primary key is not mapped")
        })?;

        if !projection.additions().is_empty() {
            for addition in projection.additions() {
                info!(
                    "Adding column {} {} to {}",
                    addition.name, addition.type_def, target_meta.table
                );
                target_access
                    .add_column(&target_meta.table, &addition.name, &addition.type_def)
                    .await?;
            }
            let altered = self
                .inspector
                .inspect(&job.target, job.target_schema.as_deref(), &job.target_table)
                .await?;
            self.store
                .save_snapshot(&snapshot_of(&job.id, SnapshotSide::Target, &job.target, &altered))
                .await?;
        }

        Ok(PreparedRun {
            source: TableSide {
                access: source_access,
                table: source_meta.table.clone(),
                key_column: source_key,
                filter: job.filter_condition.clone(),
            },
            target: TableSide {
                access: target_access,
                table: target_meta.table.clone(),
                key_column: target_key,
                filter: None,
            },
            projection: Arc::new(projection),
            key_kind,
            incremental_column,
        })
    }

    /// Compare with the latest snapshot of the same table and store a new one.
    async fn record_snapshot(
        &self,
        ctx: &mut RunContext,
        side: SnapshotSide,
        datasource: &str,
        meta: &TableSchemaMetadata,
    ) -> Result<()> {
        let snapshot = snapshot_of(&ctx.job.id, side, datasource, meta);
        if let Some(previous) = self.store.latest_snapshot(&snapshot.key()).await? {
            if previous.structure_digest != snapshot.structure_digest {
                warn!(
                    "Structure of {} table {} changed since {} ({} -> {} column(s))",
                    side, meta.table, previous.snapshot_time, previous.column_count, snapshot.column_count
                );
                ctx.drift.push(format!("{} {}", side, meta.table));
            }
        }
        self.store.save_snapshot(&snapshot).await
    }

    /// EXTRACTING: page through the source and upsert into the target.
    async fn extract(&self, ctx: &mut RunContext, prepared: &PreparedRun) -> Result<()> {
        let job = ctx.job.clone();
        let projection = &prepared.projection;

        if job.sync_mode == SyncMode::Full && self.config.sync.truncate_before_full {
            info!("Clearing {} before full extraction", prepared.target.table);
            prepared.target.access.clear_table(&prepared.target.table).await?;
        }

        let mut order_by: Vec<String> = prepared.incremental_column.iter().cloned().collect();
        for key in projection.source_primary_key() {
            if !order_by.iter().any(|c| c.eq_ignore_ascii_case(key)) {
                order_by.push(key.clone());
            }
        }
        let cursor_index: Vec<usize> = order_by
            .iter()
            .map(|c| projection.source_index(c))
            .collect::<Option<_>>()
            .ok_or_else(|| SyncError::SchemaDrift(format!("ordering columns {:?} are not read", order_by)))?;
        let watermark_index = prepared
            .incremental_column
            .as_ref()
            .and_then(|c| projection.source_index(c));

        ctx.previous_watermark = match (&ctx.checkpoint.last_incremental_value, ctx.watermark_family) {
            (Some(text), Some(family)) => Some(SqlValue::parse_as(text, family)?),
            _ => None,
        };
        let incremental = prepared
            .incremental_column
            .as_ref()
            .map(|column| IncrementalBound {
                column: column.clone(),
                after: ctx.previous_watermark.clone(),
            });

        let mut cursor: Option<Vec<SqlValue>> = None;
        loop {
            let request = PageRequest {
                columns: projection.source_columns().to_vec(),
                order_by: order_by.clone(),
                incremental: incremental.clone(),
                cursor: cursor.clone(),
                filter: prepared.source.filter.clone(),
                limit: job.batch_size,
            };
            let page = prepared
                .source
                .access
                .read_page(&prepared.source.table, &request)
                .await?;
            if page.is_empty() {
                break;
            }
            ctx.extracted_rows += page.len() as i64;

            if let Some(idx) = watermark_index {
                for row in &page {
                    ctx.observe(&row[idx]);
                }
            }
            cursor = page
                .last()
                .map(|row| cursor_index.iter().map(|i| row[*i].clone()).collect());

            let rows = projection.project_all(&page)?;
            match self.write_batch(&job, &prepared.target, projection, &rows).await {
                Ok(applied) => ctx.loaded_rows += applied as i64,
                Err(e) => {
                    ctx.failed_rows += rows.len() as i64;
                    return Err(e);
                }
            }
            debug!(
                "Job {}: {} row(s) extracted so far",
                job.id, ctx.extracted_rows
            );

            if page.len() < job.batch_size {
                break;
            }
        }

        info!(
            "Job {}: extracted {} row(s), loaded {} into {}",
            job.id, ctx.extracted_rows, ctx.loaded_rows, prepared.target.table
        );
        Ok(())
    }

    /// Upsert one batch, retrying with the job's batch policy.
    async fn write_batch(
        &self,
        job: &SyncJob,
        target: &TableSide,
        projection: &ColumnProjection,
        rows: &[Row],
    ) -> Result<u64> {
        let attempts = job.retry_count.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = target
                .access
                .upsert_rows(
                    &target.table,
                    projection.target_columns(),
                    projection.primary_key(),
                    rows,
                )
                .await;
            match result {
                Ok(applied) => return Ok(applied),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Batch of {} row(s) into {} failed (attempt {}/{}): {}",
                        rows.len(),
                        target.table,
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(job.batch_retry_interval()).await;
                }
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    return Err(SyncError::BatchWrite {
                        table: target.table.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    /// CHECKPOINTING: validation log, then checkpoint, then seal.
    async fn finish(
        &self,
        ctx: &mut RunContext,
        result: Result<()>,
        started: Instant,
    ) -> Result<RunOutcome> {
        let reached = ctx.phase;
        ctx.transition(RunPhase::Checkpointing);

        let report_status = ctx.report.as_ref().map(|r| {
            if r.needs_sync == 0 {
                ValidationStatus::Success
            } else {
                ValidationStatus::PartialSuccess
            }
        });
        let (status, validation_status, error_message) = match (&result, report_status) {
            (Err(e), _) => {
                error!("Run {} of job {} failed: {}", ctx.log.id, ctx.job.id, e);
                (ExecutionStatus::Failed, ValidationStatus::Failed, Some(e.to_string()))
            }
            (Ok(()), Some(ValidationStatus::Success)) => {
                (ExecutionStatus::Success, ValidationStatus::Success, None)
            }
            (Ok(()), Some(status)) => (ExecutionStatus::PartialSuccess, status, None),
            (Ok(()), None) => (
                ExecutionStatus::PartialSuccess,
                ValidationStatus::Failed,
                ctx.validation_error
                    .as_ref()
                    .map(|e| format!("bucket validation did not run: {}", e)),
            ),
        };

        let validation = match (&ctx.report, report_status) {
            (Some(report), Some(report_status)) => Some(validation_log(
                ctx,
                report,
                report_status,
                format!(
                    "{} bucket(s), {} mismatched before repair, {} recovered, {} need sync",
                    report.bucket_count,
                    report.initial_mismatches,
                    report.recovered,
                    report.needs_sync
                ),
            )),
            _ if result.is_err() && reached == RunPhase::Reconciling => {
                self.interrupted_validation(ctx).await?
            }
            _ => None,
        };
        if let Some(validation) = &validation {
            self.store.save_validation_log(validation).await?;
        }

        let watermark = if status == ExecutionStatus::Failed {
            ctx.checkpoint.last_incremental_value.clone()
        } else {
            let watermark = ctx.next_watermark();
            let (source_rows, target_rows, applied, skipped) = match &ctx.report {
                Some(r) => (
                    r.source_total_rows,
                    r.target_total_rows,
                    (r.bucket_count - r.needs_sync) as i64,
                    r.needs_sync as i64,
                ),
                None => (
                    ctx.checkpoint.source_row_count,
                    ctx.checkpoint.target_row_count,
                    0,
                    0,
                ),
            };
            self.store
                .update_checkpoint_after_execution(&CheckpointUpdate {
                    job_id: ctx.job.id.clone(),
                    last_incremental_value: watermark.clone(),
                    last_sync_time: Utc::now(),
                    source_row_count: source_rows,
                    target_row_count: target_rows,
                    applied_bucket_count: applied,
                    skipped_bucket_count: skipped,
                    validation_status,
                    execution_log_id: ctx.log.id,
                })
                .await?;
            watermark
        };

        let seal = self.seal(
            ctx,
            reached,
            status,
            validation_status,
            error_message.clone(),
            watermark.clone(),
            started,
        );
        self.store.seal_execution(ctx.log.id, &seal).await?;

        let repaired_rows = seal.repaired_rows;
        info!(
            "Run {} of job {} finished {} in {}ms: {} extracted, {} loaded, {} repaired",
            ctx.log.id,
            ctx.job.id,
            status,
            seal.duration_ms,
            ctx.extracted_rows,
            ctx.loaded_rows,
            repaired_rows
        );

        Ok(RunOutcome {
            execution_id: ctx.log.id,
            job_id: ctx.job.id.clone(),
            status,
            validation_status,
            extracted_rows: ctx.extracted_rows,
            loaded_rows: ctx.loaded_rows,
            repaired_rows,
            failed_rows: ctx.failed_rows,
            bucket_count: ctx.report.as_ref().map_or(0, |r| r.bucket_count),
            initial_mismatches: ctx.report.as_ref().map_or(0, |r| r.initial_mismatches),
            needs_sync: ctx.report.as_ref().map_or(0, |r| r.needs_sync),
            watermark,
            duration_ms: seal.duration_ms,
            error: error_message,
        })
    }

    /// FAILED validation log from the buckets a cut-short reconciliation stored.
    async fn interrupted_validation(&self, ctx: &RunContext) -> Result<Option<ValidationLog>> {
        let rows = self.store.list_bucket_checksums(ctx.log.id).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let initial = rows.iter().filter(|b| b.needs_sync || b.retry_count > 0).count();
        let report = BucketReport::from_buckets(rows, initial, 0);
        warn!(
            "Job {}: reconciliation interrupted, recording {} scored bucket(s)",
            ctx.job.id, report.bucket_count
        );
        let message = format!(
            "interrupted while reconciling: {} bucket(s) scored, {} still differ",
            report.bucket_count, report.needs_sync
        );
        Ok(Some(validation_log(ctx, &report, ValidationStatus::Failed, message)))
    }

    /// Final execution log fields; `phase` is the last phase the run reached.
    fn seal(
        &self,
        ctx: &RunContext,
        phase: RunPhase,
        status: ExecutionStatus,
        validation_status: ValidationStatus,
        error_message: Option<String>,
        watermark: Option<String>,
        started: Instant,
    ) -> ExecutionSeal {
        ExecutionSeal {
            status,
            finished_at: Utc::now(),
            extracted_rows: ctx.extracted_rows,
            loaded_rows: ctx.loaded_rows,
            repaired_rows: ctx.report.as_ref().map_or(0, |r| r.repaired_rows),
            failed_rows: ctx.failed_rows,
            duration_ms: started.elapsed().as_millis() as i64,
            error_message,
            detail: json!({
                "config_hash": self.config.hash(),
                "sync_mode": ctx.job.sync_mode,
                "phase": phase.to_string(),
                "dialects": ctx.dialects.as_ref().map(|(source, target)| json!({
                    "source": source,
                    "target": target,
                })),
                "validation_status": validation_status,
                "previous_watermark": ctx.checkpoint.last_incremental_value,
                "watermark": watermark,
                "buckets": ctx.report,
                "schema_drift": ctx.drift,
            }),
        }
    }
}

fn validation_log(
    ctx: &RunContext,
    report: &BucketReport,
    status: ValidationStatus,
    message: String,
) -> ValidationLog {
    ValidationLog {
        execution_log_id: ctx.log.id,
        job_id: ctx.job.id.clone(),
        source_total_rows: report.source_total_rows,
        target_total_rows: report.target_total_rows,
        source_total_checksum: report.source_total_checksum.clone(),
        target_total_checksum: report.target_total_checksum.clone(),
        bucket_count: report.bucket_count as i32,
        mismatch_count: report.needs_sync as i32,
        status,
        message,
        created_at: Utc::now(),
    }
}

fn snapshot_of(
    job_id: &str,
    side: SnapshotSide,
    datasource: &str,
    meta: &TableSchemaMetadata,
) -> TableStructureSnapshot {
    TableStructureSnapshot {
        job_id: job_id.to_string(),
        side,
        datasource: datasource.to_string(),
        schema: meta.table.schema.clone(),
        table_name: meta.table.name.clone(),
        column_count: meta.columns.len() as i32,
        primary_key_columns: meta.primary_key_columns.clone(),
        structure_digest: meta.structure_digest.clone(),
        snapshot_time: Utc::now(),
    }
}

/// Open the configured state backend, creating its tables if needed.
pub async fn open_store(config: &Config) -> Result<Arc<dyn StateBackend>> {
    match config.store.backend {
        StoreBackendKind::Memory => Ok(Arc::new(MemoryStateBackend::new())),
        StoreBackendKind::Postgres => {
            let code = config.store.datasource.as_deref().ok_or_else(|| {
                SyncError::Config("store.datasource is required for the postgres backend".into())
            })?;
            let ds_config = config.datasource(code).ok_or_else(|| {
                SyncError::Config(format!("store.datasource '{}' is not defined", code))
            })?;
            let datasource = PostgresDatasource::connect(ds_config).await?;
            let backend = PgStateBackend::new(datasource.pool().clone(), &config.store.schema)?;
            backend.init_schema().await?;
            info!(
                "Using {} state store in schema {}",
                backend.backend_type(),
                config.store.schema
            );
            Ok(Arc::new(backend))
        }
    }
}
