//! Bucket scoring, repair and classification.
//!
//! The engine works in three steps:
//!
//! - **Plan**: union the key bounds of both tables and split them into buckets
//! - **Score**: count and checksum every bucket on both sides, in parallel.
//!   When both tables live on the same kind of engine and the projection is a
//!   plain column copy, each side first answers a `COUNT`/hash aggregate and
//!   only buckets whose aggregates differ are read into memory
//! - **Repair**: for each mismatched bucket, copy the differing rows from the
//!   source and re-score, with bounded retries and backoff
//!
//! A bucket that cannot be brought into agreement is recorded with a skip
//! reason and never aborts the run.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::checksum::{format_checksum, parse_checksum, row_hash, BucketDigest};
use super::partition::{bucket_count, partition, Bucket};
use super::types::{BucketReport, BucketSettings, RowHashDiff, RowHashMap, RowKey, TableSide};
use crate::core::schema::{KeyKind, KeyRange, KeyValue};
use crate::core::value::Row;
use crate::error::{Result, SyncError};
use crate::mapping::ColumnProjection;
use crate::state::{BucketChecksum, SkipReason, StateBackend};

/// Count and checksum of one bucket on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BucketScore {
    source: BucketDigest,
    target: BucketDigest,
}

impl BucketScore {
    fn matched(&self) -> bool {
        self.source == self.target
    }

    fn write_to(&self, row: &mut BucketChecksum) {
        row.source_row_count = self.source.count;
        row.target_row_count = self.target.count;
        row.source_checksum = self.source.checksum();
        row.target_checksum = self.target.checksum();
        row.compared_at = Utc::now();
    }
}

/// Score plus key-level differences of one bucket.
struct Comparison {
    score: BucketScore,
    diff: RowHashDiff,
}

/// Validates and reconciles a source/target table pair bucket by bucket.
pub struct BucketChecksumEngine {
    source: TableSide,
    target: TableSide,
    projection: Arc<ColumnProjection>,
    key_kind: KeyKind,
    settings: BucketSettings,
    /// Source and target columns for server-side digests, when usable.
    server_columns: Option<(Vec<String>, Vec<String>)>,
}

impl BucketChecksumEngine {
    pub fn new(
        source: TableSide,
        target: TableSide,
        projection: Arc<ColumnProjection>,
        key_kind: KeyKind,
        settings: BucketSettings,
    ) -> Self {
        let same_engine = source.access.dialect_name() == target.access.dialect_name();
        let server_columns = if same_engine && projection.type_mismatches().is_empty() {
            projection
                .copied_source_columns()
                .map(|columns| (columns, projection.target_columns().to_vec()))
        } else {
            None
        };
        Self {
            source,
            target,
            projection,
            key_kind,
            settings,
            server_columns,
        }
    }

    /// Split the union of both key ranges into buckets.
    ///
    /// Returns no buckets when both tables are empty.
    pub async fn plan(&self) -> Result<Vec<Bucket>> {
        let source_filter = self.source.filter.as_deref();
        let (source_bounds, target_bounds, source_count, target_count) = tokio::try_join!(
            self.source.access.key_bounds(
                &self.source.table,
                &self.source.key_column,
                self.key_kind,
                source_filter,
            ),
            self.target.access.key_bounds(
                &self.target.table,
                &self.target.key_column,
                self.key_kind,
                None,
            ),
            self.source
                .access
                .count_rows(&self.source.table, source_filter),
            self.target.access.count_rows(&self.target.table, None),
        )?;

        let (min, max) = match (source_bounds, target_bounds) {
            (None, None) => {
                info!(
                    "{} and {} are both empty, nothing to bucket",
                    self.source.table, self.target.table
                );
                return Ok(Vec::new());
            }
            (Some(bounds), None) | (None, Some(bounds)) => bounds,
            (Some((smin, smax)), Some((tmin, tmax))) => (smin.min(tmin), smax.max(tmax)),
        };

        let n = bucket_count(
            source_count.max(target_count),
            self.settings.rows_per_bucket,
            self.settings.max_buckets,
        );
        let buckets = partition(&min, &max, n)?;
        info!(
            "Bucketing {} rows (source) / {} rows (target) over [{}, {}] into {} bucket(s)",
            source_count,
            target_count,
            min,
            max,
            buckets.len()
        );
        Ok(buckets)
    }

    /// Score every bucket, repair the mismatched ones and persist the results.
    ///
    /// Bucket-local failures are recorded on the bucket rows; only state
    /// backend failures are returned.
    pub async fn reconcile(
        &self,
        store: &dyn StateBackend,
        execution_id: Uuid,
        job_id: &str,
        buckets: &[Bucket],
    ) -> Result<BucketReport> {
        let scores = self.score_all(buckets).await;

        let mut rows: Vec<BucketChecksum> = scores
            .iter()
            .map(|(bucket, score)| scored_row(execution_id, job_id, bucket, score))
            .collect();
        store.save_bucket_checksums(&rows).await?;

        let initial_mismatches = rows.iter().filter(|r| r.needs_sync).count();
        if initial_mismatches > 0 {
            info!(
                "{} of {} bucket(s) differ, repairing",
                initial_mismatches,
                rows.len()
            );
        }

        let mut repaired_rows = 0i64;
        for ((bucket, score), row) in scores.iter().zip(rows.iter_mut()) {
            // Scoring errors are not repaired.
            if !row.needs_sync || score.is_err() {
                continue;
            }
            repaired_rows += self.repair(bucket, row).await;
            store.update_bucket_checksum(row).await?;
        }

        Ok(BucketReport::from_buckets(rows, initial_mismatches, repaired_rows))
    }

    /// Score all buckets with bounded concurrency, in bucket order.
    async fn score_all(&self, buckets: &[Bucket]) -> Vec<(Bucket, Result<BucketScore>)> {
        let mut scores: Vec<(Bucket, Result<BucketScore>)> = stream::iter(buckets.iter().cloned())
            .map(|bucket| async move {
                let score = self.score(&bucket.range).await;
                if let Err(e) = &score {
                    warn!("Bucket {} could not be scored: {}", bucket.number, e);
                }
                (bucket, score)
            })
            .buffer_unordered(self.settings.parallelism)
            .collect()
            .await;
        scores.sort_by_key(|(bucket, _)| bucket.number);
        scores
    }

    async fn score(&self, range: &KeyRange) -> Result<BucketScore> {
        if let Some(score) = self.server_score(range).await {
            if score.matched() {
                return Ok(score);
            }
            debug!("Server digests differ for [{}, ...), reading rows", range.start);
        }
        let (source_rows, target_rows) = self.read_bucket(range).await?;
        Ok(BucketScore {
            source: BucketDigest::of_rows(&source_rows),
            target: BucketDigest::of_rows(&target_rows),
        })
    }

    /// Aggregate count and hash computed by both engines, without moving rows.
    async fn server_score(&self, range: &KeyRange) -> Option<BucketScore> {
        let (source_columns, target_columns) = self.server_columns.as_ref()?;
        let digests = tokio::try_join!(
            self.source.access.range_digest(
                &self.source.table,
                source_columns,
                &self.source.key_column,
                range,
                self.source.filter.as_deref(),
            ),
            self.target.access.range_digest(
                &self.target.table,
                target_columns,
                &self.target.key_column,
                range,
                None,
            )
        );
        match digests {
            Ok((Some((sc, ss)), Some((tc, ts)))) => Some(BucketScore {
                source: BucketDigest { count: sc, sum: ss },
                target: BucketDigest { count: tc, sum: ts },
            }),
            Ok(_) => None,
            Err(e) => {
                debug!("Server digest unavailable, hashing rows instead: {}", e);
                None
            }
        }
    }

    async fn compare(&self, range: &KeyRange) -> Result<Comparison> {
        let (source_rows, target_rows) = self.read_bucket(range).await?;
        let score = BucketScore {
            source: BucketDigest::of_rows(&source_rows),
            target: BucketDigest::of_rows(&target_rows),
        };
        let diff = RowHashDiff::between(
            &self.hash_map(&source_rows)?,
            &self.hash_map(&target_rows)?,
        );
        Ok(Comparison { score, diff })
    }

    /// Both sides of a bucket in target column shape.
    async fn read_bucket(&self, range: &KeyRange) -> Result<(Vec<Row>, Vec<Row>)> {
        let (source_result, target_result) = tokio::join!(
            self.source.access.read_range(
                &self.source.table,
                self.projection.source_columns(),
                &self.source.key_column,
                range,
                self.source.filter.as_deref(),
            ),
            self.target.access.read_range(
                &self.target.table,
                self.projection.target_columns(),
                &self.target.key_column,
                range,
                None,
            )
        );
        let source_rows = self.projection.project_all(&source_result?)?;
        Ok((source_rows, target_result?))
    }

    /// Row hashes keyed by the full primary key; the bucket key leads.
    fn hash_map(&self, rows: &[Row]) -> Result<RowHashMap> {
        let indices = self.projection.key_indices().ok_or_else(|| {
            SyncError::Query(format!(
                "primary key of {} is not among the mapped columns",
                self.target.table
            ))
        })?;
        let Some((bucket_index, rest)) = indices.split_first() else {
            return Err(SyncError::Query(format!(
                "{} has no primary key to compare rows by",
                self.target.table
            )));
        };
        Ok(rows
            .iter()
            .filter_map(|row| {
                let key = RowKey {
                    bucket: KeyValue::from_sql(row.get(*bucket_index)?, self.key_kind)?,
                    rest: rest
                        .iter()
                        .map(|i| row.get(*i).and_then(|v| v.canonical_text()))
                        .collect(),
                };
                Some((key, row_hash(row)))
            })
            .collect())
    }

    /// Repair one bucket in place. Returns rows written or deleted.
    async fn repair(&self, bucket: &Bucket, row: &mut BucketChecksum) -> i64 {
        let mut repaired = 0i64;
        let mut last: Option<Result<Comparison>> = None;

        for attempt in 1..=self.settings.max_attempts {
            row.retry_count = attempt as i32;
            row.last_retry_time = Some(Utc::now());

            let outcome = self.repair_attempt(&bucket.range, &mut repaired).await;
            match &outcome {
                Ok(comparison) => {
                    comparison.score.write_to(row);
                    if comparison.score.matched() {
                        info!(
                            "Bucket {} recovered after {} attempt(s)",
                            bucket.number, attempt
                        );
                        row.retry_success = true;
                        row.needs_sync = false;
                        row.skip_reason = Some(SkipReason::RetryRecovered);
                        return repaired;
                    }
                    debug!(
                        "Bucket {} attempt {}: {} difference(s) remain",
                        bucket.number,
                        attempt,
                        comparison.diff.total_differences()
                    );
                }
                Err(e) => warn!("Bucket {} attempt {} failed: {}", bucket.number, attempt, e),
            }
            last = Some(outcome);

            if attempt < self.settings.max_attempts {
                tokio::time::sleep(self.settings.backoff(attempt)).await;
            }
        }

        let reason = match last {
            Some(Ok(comparison)) => self.classify(&comparison.diff).await,
            _ => SkipReason::CompareError,
        };
        warn!(
            "Bucket {} [{}, {}) still differs after {} attempt(s): {}",
            bucket.number,
            row.boundary_start,
            row.boundary_end.as_deref().unwrap_or("∞"),
            row.retry_count,
            reason
        );
        row.retry_success = false;
        row.needs_sync = true;
        row.skip_reason = Some(reason);
        repaired
    }

    /// Copy differing rows from the source, optionally drop orphans, re-score.
    async fn repair_attempt(&self, range: &KeyRange, repaired: &mut i64) -> Result<Comparison> {
        let before = self.compare(range).await?;

        let keys = before.diff.keys_to_copy();
        if !keys.is_empty() {
            let rows = self.fetch_source(&keys).await?;
            for chunk in rows.chunks(self.settings.upsert_batch_size) {
                let applied = self
                    .target
                    .access
                    .upsert_rows(
                        &self.target.table,
                        self.projection.target_columns(),
                        self.projection.primary_key(),
                        chunk,
                    )
                    .await?;
                *repaired += applied as i64;
            }
        }

        // Deleting by bucket key alone would drop valid rows under a composite key.
        if self.settings.delete_orphans && self.projection.primary_key().len() == 1 {
            let orphans = before.diff.orphan_keys();
            for chunk in orphans.chunks(self.settings.key_batch_size) {
                let deleted = self
                    .target
                    .access
                    .delete_by_keys(&self.target.table, &self.target.key_column, chunk)
                    .await?;
                *repaired += deleted as i64;
            }
        }

        self.compare(range).await
    }

    /// Source rows for `keys`, projected into target shape.
    async fn fetch_source(&self, keys: &[KeyValue]) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.settings.key_batch_size) {
            let fetched = self
                .source
                .access
                .read_by_keys(
                    &self.source.table,
                    self.projection.source_columns(),
                    &self.source.key_column,
                    chunk,
                )
                .await?;
            rows.extend(self.projection.project_all(&fetched)?);
        }
        Ok(rows)
    }

    async fn fetch_target(&self, keys: &[KeyValue]) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.settings.key_batch_size) {
            rows.extend(
                self.target
                    .access
                    .read_by_keys(
                        &self.target.table,
                        self.projection.target_columns(),
                        &self.target.key_column,
                        chunk,
                    )
                    .await?,
            );
        }
        Ok(rows)
    }

    /// Skip reason for a bucket that is still divergent after repair.
    async fn classify(&self, diff: &RowHashDiff) -> SkipReason {
        if !self.projection.type_mismatches().is_empty() {
            return SkipReason::TypeMismatch;
        }
        if diff.hash_mismatches.is_empty() && self.rows_are_misplaced(diff).await {
            return SkipReason::NonDeterministicOrder;
        }
        if diff.missing_in_target.is_empty()
            && diff.hash_mismatches.is_empty()
            && !diff.missing_in_source.is_empty()
            && !self.settings.delete_orphans
        {
            return SkipReason::OrphanedTargetRows;
        }
        SkipReason::RetryExhausted
    }

    /// Whether every one-sided key exists on both tables with equal hashes,
    /// i.e. the two engines place those keys in different buckets.
    async fn rows_are_misplaced(&self, diff: &RowHashDiff) -> bool {
        let rows: HashSet<&RowKey> = diff
            .missing_in_target
            .iter()
            .chain(&diff.missing_in_source)
            .collect();
        if rows.is_empty() {
            return false;
        }
        let mut keys: Vec<KeyValue> = rows.iter().map(|k| k.bucket.clone()).collect();
        keys.sort();
        keys.dedup();

        let (source, target) = tokio::join!(self.fetch_source(&keys), self.fetch_target(&keys));
        let (Ok(source), Ok(target)) = (source, target) else {
            return false;
        };
        let (Ok(source), Ok(target)) = (self.hash_map(&source), self.hash_map(&target)) else {
            return false;
        };
        rows.iter()
            .all(|key| matches!((source.get(*key), target.get(*key)), (Some(a), Some(b)) if a == b))
    }
}

fn scored_row(
    execution_id: Uuid,
    job_id: &str,
    bucket: &Bucket,
    score: &Result<BucketScore>,
) -> BucketChecksum {
    let mut row = BucketChecksum {
        execution_log_id: execution_id,
        job_id: job_id.to_string(),
        bucket_number: bucket.number,
        boundary_start: bucket.boundary_start(),
        boundary_end: bucket.boundary_end(),
        source_row_count: 0,
        target_row_count: 0,
        source_checksum: String::new(),
        target_checksum: String::new(),
        retry_count: 0,
        retry_success: false,
        needs_sync: true,
        skip_reason: Some(SkipReason::CompareError),
        compared_at: Utc::now(),
        last_retry_time: None,
    };
    if let Ok(score) = score {
        score.write_to(&mut row);
        row.needs_sync = !score.matched();
        row.skip_reason = None;
    }
    row
}

impl BucketReport {
    /// Totals over stored bucket rows.
    pub fn from_buckets(
        buckets: Vec<BucketChecksum>,
        initial_mismatches: usize,
        repaired_rows: i64,
    ) -> Self {
        let mut source_total = BucketDigest::default();
        let mut target_total = BucketDigest::default();
        for row in &buckets {
            source_total.combine(&BucketDigest {
                count: row.source_row_count,
                sum: parse_checksum(&row.source_checksum).unwrap_or(0),
            });
            target_total.combine(&BucketDigest {
                count: row.target_row_count,
                sum: parse_checksum(&row.target_checksum).unwrap_or(0),
            });
        }

        BucketReport {
            bucket_count: buckets.len(),
            initial_mismatches,
            recovered: buckets.iter().filter(|b| b.retry_success).count(),
            needs_sync: buckets.iter().filter(|b| b.needs_sync).count(),
            source_total_rows: source_total.count,
            target_total_rows: target_total.count,
            source_total_checksum: format_checksum(source_total.sum),
            target_total_checksum: format_checksum(target_total.sum),
            repaired_rows,
            buckets,
        }
    }
}
