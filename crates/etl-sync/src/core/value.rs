//! SQL value types for engine-independent row handling.
//!
//! Rows travel between drivers as `Vec<SqlValue>`. Every driver decodes its
//! native types into this enum and binds it back when writing, so the sync
//! engine never sees driver-specific values.
//!
//! Two renderings matter beyond transport:
//!
//! - [`SqlValue::canonical_text`] produces the engine-independent form that row
//!   hashes are computed over. A boolean read from MySQL as `1` and a
//!   PostgreSQL `true` render identically, and so do `42::bigint` and
//!   `42.00::numeric`.
//! - [`SqlValue::parse_as`] turns a stored watermark string back into a typed
//!   value so that incremental predicates compare natively on the source.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// A row in column order.
pub type Row = Vec<SqlValue>;

/// Type hint for NULL values so drivers can bind a correctly typed NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I64,
    F64,
    Decimal,
    String,
    Bytes,
    Uuid,
    Date,
    Time,
    DateTime,
    DateTimeUtc,
}

/// Owned SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with type hint for binding.
    Null(SqlNullType),
    Bool(bool),
    /// All integer widths widen to i64.
    I64(i64),
    F64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with timezone, normalized to UTC.
    DateTimeUtc(DateTime<Utc>),
}

/// Coarse type classification derived from a column's declared type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeFamily {
    Boolean,
    Integer,
    Decimal,
    Float,
    Text,
    Uuid,
    Date,
    Time,
    DateTime,
    Binary,
    Other,
}

impl TypeFamily {
    /// Classify a declared type name such as `varchar(20)`, `BIGINT UNSIGNED`
    /// or `timestamp with time zone`.
    pub fn from_type_name(type_name: &str) -> Self {
        let lower = type_name.trim().to_lowercase();
        let base = lower.split('(').next().unwrap_or("").trim();
        let base = base.trim_end_matches(" unsigned").trim();

        match base {
            "bool" | "boolean" | "bit" => TypeFamily::Boolean,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "int2"
            | "int4" | "int8" | "serial" | "bigserial" | "smallserial" => TypeFamily::Integer,
            "decimal" | "numeric" | "number" | "money" | "smallmoney" => TypeFamily::Decimal,
            "float" | "real" | "double" | "double precision" | "float4" | "float8"
            | "binary_float" | "binary_double" => TypeFamily::Float,
            "uuid" | "uniqueidentifier" => TypeFamily::Uuid,
            "date" => TypeFamily::Date,
            "time" | "time without time zone" | "time with time zone" | "timetz" => {
                TypeFamily::Time
            }
            "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" | "timestamp"
            | "timestamptz" | "timestamp without time zone" | "timestamp with time zone" => {
                TypeFamily::DateTime
            }
            "binary" | "varbinary" | "bytea" | "blob" | "tinyblob" | "mediumblob"
            | "longblob" | "image" | "raw" | "long raw" => TypeFamily::Binary,
            "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" | "tinytext"
            | "mediumtext" | "longtext" | "character" | "character varying" | "varchar2"
            | "nvarchar2" | "clob" | "nclob" | "citext" | "name" | "enum" | "set" | "json"
            | "jsonb" | "xml" | "string" => TypeFamily::Text,
            _ if base.starts_with("timestamp") => TypeFamily::DateTime,
            _ => TypeFamily::Other,
        }
    }

    /// Whether values of the two families render to comparable canonical text.
    ///
    /// Families in the same group hash identically for equal values; anything
    /// else will make bucket checksums disagree no matter how often rows are
    /// re-applied. `Other` is never flagged.
    pub fn compatible_with(self, other: TypeFamily) -> bool {
        self.group() == other.group() || self == TypeFamily::Other || other == TypeFamily::Other
    }

    fn group(self) -> u8 {
        match self {
            TypeFamily::Boolean | TypeFamily::Integer | TypeFamily::Decimal => 0,
            TypeFamily::Float => 1,
            TypeFamily::Text | TypeFamily::Uuid => 2,
            TypeFamily::Date => 3,
            TypeFamily::Time => 4,
            TypeFamily::DateTime => 5,
            TypeFamily::Binary => 6,
            TypeFamily::Other => 7,
        }
    }
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Get the SqlNullType for this value (for type-aware NULL binding).
    #[must_use]
    pub fn null_type(&self) -> SqlNullType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => SqlNullType::Bool,
            SqlValue::I64(_) => SqlNullType::I64,
            SqlValue::F64(_) => SqlNullType::F64,
            SqlValue::Decimal(_) => SqlNullType::Decimal,
            SqlValue::Text(_) => SqlNullType::String,
            SqlValue::Bytes(_) => SqlNullType::Bytes,
            SqlValue::Uuid(_) => SqlNullType::Uuid,
            SqlValue::Date(_) => SqlNullType::Date,
            SqlValue::Time(_) => SqlNullType::Time,
            SqlValue::DateTime(_) => SqlNullType::DateTime,
            SqlValue::DateTimeUtc(_) => SqlNullType::DateTimeUtc,
        }
    }

    /// Engine-independent text form, `None` for NULL.
    pub fn canonical_text(&self) -> Option<String> {
        let text = match self {
            SqlValue::Null(_) => return None,
            SqlValue::Bool(v) => (if *v { "1" } else { "0" }).to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F64(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.007_199_254_740_992e15 {
                    format!("{}", *v as i64)
                } else {
                    format!("{}", v)
                }
            }
            SqlValue::Decimal(v) => v.normalize().to_string(),
            SqlValue::Text(v) => v.clone(),
            SqlValue::Bytes(v) => hex::encode(v),
            SqlValue::Uuid(v) => v.hyphenated().to_string(),
            SqlValue::Date(v) => v.format("%Y-%m-%d").to_string(),
            SqlValue::Time(v) => format!("{}{}", v.format("%H:%M:%S"), fraction(v.nanosecond())),
            SqlValue::DateTime(v) => format_datetime(v),
            SqlValue::DateTimeUtc(v) => format_datetime(&v.naive_utc()),
        };
        Some(text)
    }

    /// Parse stored text back into a value of the given family.
    ///
    /// Used for watermarks, which are persisted as canonical text.
    pub fn parse_as(text: &str, family: TypeFamily) -> Result<SqlValue> {
        let bad = |what: &str| {
            SyncError::Query(format!("cannot parse {:?} as {}", text, what))
        };
        let value = match family {
            TypeFamily::Integer => match text.parse::<i64>() {
                Ok(v) => SqlValue::I64(v),
                Err(_) => SqlValue::Decimal(Decimal::from_str(text).map_err(|_| bad("integer"))?),
            },
            TypeFamily::Decimal => {
                SqlValue::Decimal(Decimal::from_str(text).map_err(|_| bad("decimal"))?)
            }
            TypeFamily::Float => SqlValue::F64(text.parse::<f64>().map_err(|_| bad("float"))?),
            TypeFamily::Boolean => match text {
                "1" | "true" | "TRUE" => SqlValue::Bool(true),
                "0" | "false" | "FALSE" => SqlValue::Bool(false),
                _ => return Err(bad("boolean")),
            },
            TypeFamily::Date => SqlValue::Date(
                NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| bad("date"))?,
            ),
            TypeFamily::Time => SqlValue::Time(
                NaiveTime::parse_from_str(text, "%H:%M:%S%.f").map_err(|_| bad("time"))?,
            ),
            TypeFamily::DateTime => {
                SqlValue::DateTime(parse_datetime(text).ok_or_else(|| bad("timestamp"))?)
            }
            TypeFamily::Uuid => match Uuid::parse_str(text) {
                Ok(v) => SqlValue::Uuid(v),
                Err(_) => SqlValue::Text(text.to_string()),
            },
            TypeFamily::Text | TypeFamily::Binary | TypeFamily::Other => {
                SqlValue::Text(text.to_string())
            }
        };
        Ok(value)
    }

    /// Compare two values for watermark purposes.
    ///
    /// Numeric variants compare across widths, temporal variants compare on a
    /// common naive timeline. Returns `None` for NULLs and unrelated kinds.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        use SqlValue::*;
        match (self, other) {
            (I64(a), I64(b)) => Some(a.cmp(b)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Uuid(a), Uuid(b)) => Some(a.cmp(b)),
            (Time(a), Time(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (F64(a), F64(b)) => a.partial_cmp(b),
            _ => {
                if let (Some(a), Some(b)) = (self.as_decimal(), other.as_decimal()) {
                    return Some(a.cmp(&b));
                }
                if let (Some(a), Some(b)) = (self.as_naive_datetime(), other.as_naive_datetime()) {
                    return Some(a.cmp(&b));
                }
                None
            }
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            SqlValue::I64(v) => Some(Decimal::from(*v)),
            SqlValue::Decimal(v) => Some(*v),
            SqlValue::F64(v) => Decimal::from_f64(*v),
            SqlValue::Bool(v) => Some(Decimal::from(*v as i64)),
            _ => None,
        }
    }

    fn as_naive_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::DateTime(v) => Some(*v),
            SqlValue::DateTimeUtc(v) => Some(v.naive_utc()),
            SqlValue::Date(v) => v.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }

    /// Integer view of the value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I64(v) => Some(*v),
            SqlValue::Decimal(v) if v.fract().is_zero() => v.to_i64(),
            SqlValue::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.canonical_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "NULL"),
        }
    }
}

fn fraction(nanos: u32) -> String {
    let nanos = nanos % 1_000_000_000;
    if nanos == 0 {
        return String::new();
    }
    let digits = format!("{:09}", nanos);
    format!(".{}", digits.trim_end_matches('0'))
}

fn format_datetime(v: &NaiveDateTime) -> String {
    format!("{}{}", v.format("%Y-%m-%d %H:%M:%S"), fraction(v.nanosecond()))
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    const FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
    for fmt in FORMATS {
        if let Ok(v) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(v);
        }
    }
    if let Ok(v) = DateTime::parse_from_rfc3339(text) {
        return Some(v.naive_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
