//! Bucketed consistency validation and repair.
//!
//! The primary-key space shared by a source and target table is split into
//! contiguous buckets. Each bucket is scored on both sides with an
//! order-independent checksum:
//!
//! - **Row hash**: SHA-256 over a length-prefixed canonical encoding of the
//!   projected row, reduced modulo `2^61 - 1`
//! - **Bucket checksum**: modular sum of the row hashes plus the row count
//! - **Repair**: divergent buckets are diffed key by key, missing and changed
//!   rows are copied from the source, and the bucket is re-scored
//!
//! Buckets that cannot be brought back into agreement are recorded with a
//! [`SkipReason`](crate::state::SkipReason) and flagged `needs_sync`.

pub mod checksum;
mod engine;
pub mod partition;
pub mod types;

pub use checksum::{row_hash, BucketDigest, MODULUS};
pub use engine::BucketChecksumEngine;
pub use partition::{bucket_count, bucket_key, partition, Bucket};
pub use types::{BucketReport, BucketSettings, RowHashDiff, RowHashMap, RowKey, TableSide};
