//! Row hashing and order-independent bucket checksums.
//!
//! Each row is encoded value by value: `0x00` for NULL, otherwise `0x01`, the
//! byte length of the canonical text as a little-endian `u32`, and the text
//! itself. The row hash is the first 8 bytes of SHA-256 over that encoding,
//! big-endian, reduced modulo the Mersenne prime `2^61 - 1`.
//!
//! A bucket checksum is the sum of its row hashes modulo the same prime,
//! rendered as 16 lowercase hex digits. Addition makes it independent of row
//! order while still counting duplicates.

use sha2::{Digest, Sha256};

use crate::core::value::SqlValue;

/// `2^61 - 1`.
pub const MODULUS: u64 = (1 << 61) - 1;

/// Hash one row of canonicalized values.
pub fn row_hash(row: &[SqlValue]) -> u64 {
    let mut hasher = Sha256::new();
    for value in row {
        match value.canonical_text() {
            None => hasher.update([0u8]),
            Some(text) => {
                hasher.update([1u8]);
                hasher.update((text.len() as u32).to_le_bytes());
                hasher.update(text.as_bytes());
            }
        }
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % MODULUS
}

/// `(a + b) mod P` for operands already reduced.
pub fn add_mod(a: u64, b: u64) -> u64 {
    let sum = a + b;
    if sum >= MODULUS {
        sum - MODULUS
    } else {
        sum
    }
}

/// Row count and hash sum of a set of rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketDigest {
    pub count: i64,
    pub sum: u64,
}

impl BucketDigest {
    /// Digest of a slice of rows.
    pub fn of_rows(rows: &[Vec<SqlValue>]) -> Self {
        let mut digest = Self::default();
        for row in rows {
            digest.add(row_hash(row));
        }
        digest
    }

    pub fn add(&mut self, hash: u64) {
        self.count += 1;
        self.sum = add_mod(self.sum, hash);
    }

    /// Fold another digest into this one.
    pub fn combine(&mut self, other: &BucketDigest) {
        self.count += other.count;
        self.sum = add_mod(self.sum, other.sum);
    }

    /// Stored checksum text.
    pub fn checksum(&self) -> String {
        format_checksum(self.sum)
    }
}

pub fn format_checksum(sum: u64) -> String {
    format!("{:016x}", sum)
}

/// Parse a stored checksum; `None` for anything that is not one.
pub fn parse_checksum(text: &str) -> Option<u64> {
    if text.len() != 16 {
        return None;
    }
    u64::from_str_radix(text, 16).ok().filter(|v| *v < MODULUS)
}
