//! Key-range bucketing.
//!
//! Buckets are half-open `[start, end)` ranges that together cover the key
//! range `[min, max]` with no gaps or overlaps. Integer keys split into equal
//! widths. Text keys are split by interpolating the first three code points
//! after the common prefix of `min` and `max`, treated as a base-`0x110000`
//! number in which digit 0 marks the end of the string.

use crate::core::schema::{KeyKind, KeyRange, KeyValue, TableSchemaMetadata};
use crate::core::value::TypeFamily;
use crate::error::{Result, SyncError};

const TEXT_BASE: u128 = 0x11_0000;
const TEXT_DIGITS: usize = 3;

/// One bucket of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// 0-based, in key order.
    pub number: i32,
    pub range: KeyRange,
}

impl Bucket {
    pub fn boundary_start(&self) -> String {
        self.range.start.to_string()
    }

    pub fn boundary_end(&self) -> Option<String> {
        self.range.end.as_ref().map(KeyValue::to_string)
    }
}

/// Bucket key column and kind for a table, from its first primary key column.
pub fn bucket_key(meta: &TableSchemaMetadata) -> Result<(String, KeyKind)> {
    let Some(key) = meta.primary_key_columns.first() else {
        return Err(SyncError::unsupported_key(
            meta.table.to_string(),
            "table has no primary key",
        ));
    };
    let column = meta.column(key).ok_or_else(|| {
        SyncError::unsupported_key(
            meta.table.to_string(),
            format!("primary key column {} is not among the table columns", key),
        )
    })?;
    if column.family() == TypeFamily::Decimal && column.scale.map_or(false, |s| s > 0) {
        return Err(SyncError::unsupported_key(
            meta.table.to_string(),
            format!(
                "key column {} has fractional type {}({},{}) and cannot be range-bucketed",
                column.name,
                column.type_name,
                column.size.unwrap_or_default(),
                column.scale.unwrap_or_default()
            ),
        ));
    }
    match KeyKind::for_family(column.family()) {
        Some(kind) => Ok((column.name.clone(), kind)),
        None => Err(SyncError::unsupported_key(
            meta.table.to_string(),
            format!(
                "key column {} has type {}, which cannot be range-bucketed",
                column.name, column.type_name
            ),
        )),
    }
}

/// `clamp(ceil(rows / rows_per_bucket), 1, max_buckets)`.
pub fn bucket_count(rows: i64, rows_per_bucket: usize, max_buckets: usize) -> usize {
    let rows = rows.max(0) as u64;
    let per = rows_per_bucket.max(1) as u64;
    let wanted = rows.div_ceil(per);
    (wanted.min(max_buckets.max(1) as u64) as usize).max(1)
}

/// Split `[min, max]` into at most `n` buckets.
pub fn partition(min: &KeyValue, max: &KeyValue, n: usize) -> Result<Vec<Bucket>> {
    let ranges = match (min, max) {
        (KeyValue::Int(min), KeyValue::Int(max)) => int_ranges(*min, *max, n),
        (KeyValue::Text(min), KeyValue::Text(max)) => text_ranges(min, max, n),
        _ => {
            return Err(SyncError::Query(format!(
                "key bounds {} and {} are of different kinds",
                min, max
            )))
        }
    };
    Ok(ranges
        .into_iter()
        .enumerate()
        .map(|(i, range)| Bucket {
            number: i as i32,
            range,
        })
        .collect())
}

fn int_ranges(min: i64, max: i64, n: usize) -> Vec<KeyRange> {
    let (lo, hi) = (min.min(max) as i128, min.max(max) as i128);
    let width = hi - lo + 1;
    let n = (n.max(1) as i128).min(width);

    let start_of = |i: i128| lo + i * width / n;
    (0..n)
        .map(|i| {
            let start = start_of(i);
            let end = if i + 1 == n { hi + 1 } else { start_of(i + 1) };
            KeyRange {
                start: KeyValue::Int(start as i64),
                end: i64::try_from(end).ok().map(KeyValue::Int),
            }
        })
        .collect()
}

fn text_ranges(min: &str, max: &str, n: usize) -> Vec<KeyRange> {
    let (min, max) = if min <= max { (min, max) } else { (max, min) };

    let prefix_len: usize = min
        .chars()
        .zip(max.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();
    let prefix = &min[..prefix_len];
    let low = encode_digits(&min[prefix_len..]);
    let high = encode_digits(&max[prefix_len..]);

    let mut splits: Vec<String> = Vec::new();
    if n > 1 && high > low {
        let n = n as u128;
        for i in 1..n {
            let point = decode_digits(prefix, low + (high - low) * i / n);
            let above_previous = splits.last().map_or(point.as_str() > min, |last| point > *last);
            if above_previous && point.as_str() <= max {
                splits.push(point);
            }
        }
    }

    let mut ranges = Vec::with_capacity(splits.len() + 1);
    let mut start = min.to_string();
    for split in splits {
        ranges.push(KeyRange {
            start: KeyValue::Text(start),
            end: Some(KeyValue::Text(split.clone())),
        });
        start = split;
    }
    ranges.push(KeyRange {
        start: KeyValue::Text(start),
        end: None,
    });
    ranges
}

fn encode_digits(suffix: &str) -> u128 {
    let mut chars = suffix.chars();
    (0..TEXT_DIGITS).fold(0u128, |acc, _| {
        let digit = chars.next().map_or(0, |c| c as u128);
        acc * TEXT_BASE + digit
    })
}

fn decode_digits(prefix: &str, value: u128) -> String {
    let mut digits = [0u32; TEXT_DIGITS];
    let mut rest = value;
    for slot in digits.iter_mut().rev() {
        *slot = (rest % TEXT_BASE) as u32;
        rest /= TEXT_BASE;
    }

    let mut out = prefix.to_string();
    for digit in digits {
        if digit == 0 {
            break;
        }
        match char::from_u32(digit) {
            Some(c) => out.push(c),
            None => {
                // Surrogates are not chars; the next valid code point sorts above them.
                out.push('\u{E000}');
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{ColumnMetadata, TableRef};

    fn assert_int_coverage(min: i64, max: i64, n: usize) {
        let buckets = partition(&KeyValue::Int(min), &KeyValue::Int(max), n).unwrap();
        assert!(!buckets.is_empty());
        assert!(buckets.len() <= n.max(1));
        assert_eq!(buckets[0].range.start, KeyValue::Int(min));
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].range.end, Some(pair[1].range.start.clone()));
            assert!(pair[0].range.start < pair[1].range.start);
        }
        let last = buckets.last().unwrap();
        match &last.range.end {
            Some(KeyValue::Int(end)) => assert_eq!(*end as i128, max as i128 + 1),
            None => assert_eq!(max, i64::MAX),
            other => panic!("unexpected end {:?}", other),
        }
    }

    #[test]
    fn test_int_buckets_cover_range_exactly() {
        for (min, max, n) in [
            (1, 10_000, 10),
            (1, 10_000, 7),
            (-50, 50, 3),
            (5, 5, 4),
            (0, 2, 1024),
            (i64::MAX - 10, i64::MAX, 4),
            (i64::MIN, i64::MAX, 16),
        ] {
            assert_int_coverage(min, max, n);
        }
    }

    #[test]
    fn test_int_buckets_capped_at_key_width() {
        let buckets = partition(&KeyValue::Int(1), &KeyValue::Int(3), 100).unwrap();
        assert_eq!(buckets.len(), 3);
        let every_key: Vec<i64> = (1..=3).collect();
        for key in every_key {
            let hits = buckets
                .iter()
                .filter(|b| b.range.contains(&KeyValue::Int(key)))
                .count();
            assert_eq!(hits, 1);
        }
    }

    #[test]
    fn test_int_bucket_contains_every_key_once() {
        let buckets = partition(&KeyValue::Int(1), &KeyValue::Int(1000), 7).unwrap();
        for key in 1..=1000 {
            let hits = buckets
                .iter()
                .filter(|b| b.range.contains(&KeyValue::Int(key)))
                .count();
            assert_eq!(hits, 1, "key {}", key);
        }
    }

    #[test]
    fn test_text_buckets_cover_range() {
        let min = "apple";
        let max = "pear";
        let buckets = partition(&KeyValue::Text(min.into()), &KeyValue::Text(max.into()), 8).unwrap();
        assert!(buckets.len() > 1);
        assert_eq!(buckets[0].range.start, KeyValue::Text(min.into()));
        assert_eq!(buckets.last().unwrap().range.end, None);
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].range.end, Some(pair[1].range.start.clone()));
            assert!(pair[0].range.start < pair[1].range.start);
        }
        for key in ["apple", "banana", "kiwi", "orange", "pea", "pear"] {
            let hits = buckets
                .iter()
                .filter(|b| b.range.contains(&KeyValue::Text(key.into())))
                .count();
            assert_eq!(hits, 1, "key {}", key);
        }
    }

    #[test]
    fn test_text_buckets_with_common_prefix_and_uuid_shape() {
        let min = "00000000-0000-0000-0000-000000000001";
        let max = "ffffffff-ffff-ffff-ffff-ffffffffffff";
        let buckets = partition(&KeyValue::Text(min.into()), &KeyValue::Text(max.into()), 16).unwrap();
        assert!(buckets.len() >= 2);
        let uuid = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
        let hits = buckets
            .iter()
            .filter(|b| b.range.contains(&KeyValue::Text(uuid.into())))
            .count();
        assert_eq!(hits, 1);

        let narrow = partition(
            &KeyValue::Text("order-0001".into()),
            &KeyValue::Text("order-0009".into()),
            4,
        )
        .unwrap();
        for b in &narrow {
            if let KeyValue::Text(start) = &b.range.start {
                assert!(start.starts_with("order-000"));
            }
        }
    }

    #[test]
    fn test_text_single_value_gives_one_bucket() {
        let buckets = partition(&KeyValue::Text("x".into()), &KeyValue::Text("x".into()), 8).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].range.end, None);
    }

    #[test]
    fn test_surrogate_digits_are_skipped() {
        let s = decode_digits("p", 0xD800 * TEXT_BASE * TEXT_BASE + 5);
        assert_eq!(s, "p\u{E000}");
        assert!(encode_digits("\u{E000}") > 0xD800 * TEXT_BASE * TEXT_BASE);
    }

    #[test]
    fn test_bucket_count_formula() {
        assert_eq!(bucket_count(0, 1000, 1024), 1);
        assert_eq!(bucket_count(10_000, 1000, 1024), 10);
        assert_eq!(bucket_count(10_001, 1000, 1024), 11);
        assert_eq!(bucket_count(50_000_000, 1000, 1024), 1024);
    }

    #[test]
    fn test_mixed_kinds_rejected() {
        assert!(partition(&KeyValue::Int(1), &KeyValue::Text("a".into()), 2).is_err());
    }

    #[test]
    fn test_bucket_key_requires_orderable_primary_key() {
        let meta = |columns: Vec<ColumnMetadata>, pk: Vec<&str>| TableSchemaMetadata {
            table: TableRef::new(None, "t"),
            columns,
            primary_key_columns: pk.into_iter().map(String::from).collect(),
            structure_digest: String::new(),
        };

        let ok = meta(vec![ColumnMetadata::new("id", "bigint", 1).with_primary_key(1)], vec!["id"]);
        assert_eq!(bucket_key(&ok).unwrap(), ("id".to_string(), KeyKind::Int));

        let none = meta(vec![ColumnMetadata::new("id", "bigint", 1)], vec![]);
        assert!(matches!(bucket_key(&none), Err(SyncError::UnsupportedKeyType { .. })));

        let float = meta(vec![ColumnMetadata::new("x", "double", 1).with_primary_key(1)], vec!["x"]);
        assert!(matches!(bucket_key(&float), Err(SyncError::UnsupportedKeyType { .. })));
    }

    #[test]
    fn test_bucket_key_rejects_fractional_decimal() {
        let meta = |scale: Option<i64>| TableSchemaMetadata {
            table: TableRef::new(None, "t"),
            columns: vec![ColumnMetadata::new("n", "numeric", 1)
                .with_size(Some(12), scale)
                .with_primary_key(1)],
            primary_key_columns: vec!["n".into()],
            structure_digest: String::new(),
        };

        let err = bucket_key(&meta(Some(2))).unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedKeyType { .. }));
        assert!(err.to_string().contains("fractional"));
        assert_eq!(bucket_key(&meta(Some(0))).unwrap(), ("n".to_string(), KeyKind::Int));
        assert_eq!(bucket_key(&meta(None)).unwrap(), ("n".to_string(), KeyKind::Int));
    }
}
