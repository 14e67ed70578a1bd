//! Table, column and key metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::identifier::normalize_schema;
use crate::core::value::{SqlValue, TypeFamily};

/// A table addressed by optional schema and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    /// Build a reference, normalizing a blank schema to `None`.
    pub fn new(schema: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            schema: normalize_schema(schema),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Column descriptor as reported by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Column name.
    pub name: String,

    /// Declared type name (e.g. "varchar", "BIGINT", "numeric").
    pub type_name: String,

    /// Character length or numeric precision.
    pub size: Option<i64>,

    /// Numeric scale.
    pub scale: Option<i64>,

    /// `None` when the engine did not report nullability; treated as nullable.
    pub nullable: Option<bool>,

    /// 1-based ordinal position.
    pub ordinal: Option<i32>,

    /// Whether the column is part of the primary key.
    pub primary_key: bool,

    /// Position within the primary key, when known.
    pub key_sequence: Option<i32>,
}

impl ColumnMetadata {
    /// Convenience constructor used by metadata services and tests.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, ordinal: i32) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            size: None,
            scale: None,
            nullable: Some(true),
            ordinal: Some(ordinal),
            primary_key: false,
            key_sequence: None,
        }
    }

    /// Mark this column as the `seq`-th primary key column.
    pub fn with_primary_key(mut self, seq: i32) -> Self {
        self.primary_key = true;
        self.key_sequence = Some(seq);
        self.nullable = Some(false);
        self
    }

    /// Set size and scale.
    pub fn with_size(mut self, size: Option<i64>, scale: Option<i64>) -> Self {
        self.size = size;
        self.scale = scale;
        self
    }

    /// Type family of the declared type.
    pub fn family(&self) -> TypeFamily {
        TypeFamily::from_type_name(&self.type_name)
    }

    /// Whether the column accepts NULL. An unknown answer counts as nullable.
    pub fn is_nullable(&self) -> bool {
        self.nullable != Some(false)
    }

    /// Type definition for `ALTER TABLE ... ADD`, keeping the length of
    /// character types and the precision/scale of decimal types.
    pub fn type_definition(&self) -> String {
        if self.type_name.contains('(') {
            return self.type_name.clone();
        }
        match (self.family(), self.size, self.scale) {
            (TypeFamily::Text, Some(size), _) if size > 0 => {
                format!("{}({})", self.type_name, size)
            }
            (TypeFamily::Decimal, Some(size), Some(scale)) if size > 0 => {
                format!("{}({},{})", self.type_name, size, scale)
            }
            _ => self.type_name.clone(),
        }
    }
}

/// Table-level descriptor as reported by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub schema: Option<String>,
    pub name: String,
    /// Comma-separated primary key column list, when the engine reports it
    /// at table level rather than per column.
    pub primary_key: Option<String>,
}

/// Inspected structure of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchemaMetadata {
    pub table: TableRef,
    /// Columns in ordinal order.
    pub columns: Vec<ColumnMetadata>,
    /// Primary key columns in key order.
    pub primary_key_columns: Vec<String>,
    /// Lowercase hex SHA-256 of the column and key definition.
    pub structure_digest: String,
}

impl TableSchemaMetadata {
    /// Find a column by name, ignoring case.
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Kind of bucket key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    Int,
    Text,
}

impl KeyKind {
    /// Key kind for a column family, `None` if the family cannot be bucketed.
    pub fn for_family(family: TypeFamily) -> Option<Self> {
        match family {
            TypeFamily::Integer | TypeFamily::Decimal => Some(KeyKind::Int),
            TypeFamily::Text | TypeFamily::Uuid => Some(KeyKind::Text),
            _ => None,
        }
    }
}

/// A value of the bucket key column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl KeyValue {
    /// Convert a fetched value into a key of the given kind.
    pub fn from_sql(value: &SqlValue, kind: KeyKind) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        match kind {
            KeyKind::Int => value.as_i64().map(KeyValue::Int),
            KeyKind::Text => value.canonical_text().map(KeyValue::Text),
        }
    }

    /// Value to bind as a query parameter.
    pub fn to_sql_value(&self) -> SqlValue {
        match self {
            KeyValue::Int(v) => SqlValue::I64(*v),
            KeyValue::Text(v) => SqlValue::Text(v.clone()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Half-open key interval `[start, end)`. `end = None` is unbounded above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: KeyValue,
    pub end: Option<KeyValue>,
}

impl KeyRange {
    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &KeyValue) -> bool {
        key >= &self.start && self.end.as_ref().map_or(true, |end| key < end)
    }
}
