//! Type definitions for bucketed verification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{SyncConfig, SyncJob};
use crate::core::schema::{KeyValue, TableRef};
use crate::core::traits::TableAccess;
use crate::state::BucketChecksum;

/// Full primary key of a projected row.
///
/// `bucket` is the leading key column, the one buckets and key lookups use.
/// `rest` holds the canonical text of any further key columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub bucket: KeyValue,
    pub rest: Vec<Option<String>>,
}

impl RowKey {
    /// Key of a single-column primary key.
    pub fn single(bucket: KeyValue) -> Self {
        Self {
            bucket,
            rest: Vec::new(),
        }
    }
}

/// Primary key → row hash within one bucket.
pub type RowHashMap = HashMap<RowKey, u64>;

/// Key-level differences between the source and target side of a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowHashDiff {
    /// Keys present on the source only.
    pub missing_in_target: Vec<RowKey>,
    /// Keys present on both sides with different row hashes.
    pub hash_mismatches: Vec<RowKey>,
    /// Keys present on the target only.
    pub missing_in_source: Vec<RowKey>,
}

impl RowHashDiff {
    /// Compare two hash maps. Key lists come back sorted.
    pub fn between(source: &RowHashMap, target: &RowHashMap) -> Self {
        let mut diff = Self::default();
        for (key, hash) in source {
            match target.get(key) {
                None => diff.missing_in_target.push(key.clone()),
                Some(other) if other != hash => diff.hash_mismatches.push(key.clone()),
                Some(_) => {}
            }
        }
        diff.missing_in_source = target
            .keys()
            .filter(|k| !source.contains_key(*k))
            .cloned()
            .collect();
        diff.missing_in_target.sort();
        diff.hash_mismatches.sort();
        diff.missing_in_source.sort();
        diff
    }

    pub fn has_differences(&self) -> bool {
        self.total_differences() > 0
    }

    pub fn total_differences(&self) -> usize {
        self.missing_in_target.len() + self.hash_mismatches.len() + self.missing_in_source.len()
    }

    /// Bucket keys whose source rows must be copied to the target, sorted
    /// and distinct. With a composite key every row sharing a listed leading
    /// value is copied.
    pub fn keys_to_copy(&self) -> Vec<KeyValue> {
        bucket_keys(self.missing_in_target.iter().chain(&self.hash_mismatches))
    }

    /// Bucket keys of target-only rows, sorted and distinct.
    pub fn orphan_keys(&self) -> Vec<KeyValue> {
        bucket_keys(&self.missing_in_source)
    }
}

fn bucket_keys<'a>(keys: impl IntoIterator<Item = &'a RowKey>) -> Vec<KeyValue> {
    let mut keys: Vec<KeyValue> = keys.into_iter().map(|k| k.bucket.clone()).collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Tunables for one job's bucket validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSettings {
    pub rows_per_bucket: usize,
    pub max_buckets: usize,
    pub parallelism: usize,
    pub key_batch_size: usize,
    pub upsert_batch_size: usize,
    /// Repair attempts per mismatched bucket, at least 1.
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub delete_orphans: bool,
}

impl BucketSettings {
    pub fn new(sync: &SyncConfig, job: &SyncJob) -> Self {
        Self {
            rows_per_bucket: sync.get_rows_per_bucket(),
            max_buckets: sync.get_max_buckets(),
            parallelism: sync.get_bucket_parallelism().max(1),
            key_batch_size: sync.get_key_batch_size().max(1),
            upsert_batch_size: sync.get_upsert_batch_size().max(1),
            max_attempts: job.bucket_retry_count().max(1),
            retry_interval: job.bucket_retry_interval(),
            delete_orphans: sync.delete_orphans,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `interval × 2^min(attempt-1, 4)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_interval * (1u32 << attempt.saturating_sub(1).min(4))
    }
}

/// One table as seen by the bucket engine.
#[derive(Clone)]
pub struct TableSide {
    pub access: Arc<dyn TableAccess>,
    pub table: TableRef,
    /// Bucket key column in this table.
    pub key_column: String,
    /// Trusted predicate ANDed into every read.
    pub filter: Option<String>,
}

/// Result of validating and reconciling all buckets of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BucketReport {
    /// Final state of every bucket, in bucket order.
    #[serde(skip)]
    pub buckets: Vec<BucketChecksum>,
    pub bucket_count: usize,
    /// Buckets that disagreed when first scored.
    pub initial_mismatches: usize,
    /// Buckets brought back into agreement by repair.
    pub recovered: usize,
    /// Buckets still divergent after repair.
    pub needs_sync: usize,
    pub source_total_rows: i64,
    pub target_total_rows: i64,
    pub source_total_checksum: String,
    pub target_total_checksum: String,
    /// Rows upserted or deleted during repair.
    pub repaired_rows: i64,
}
