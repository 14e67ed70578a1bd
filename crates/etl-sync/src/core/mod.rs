//! Core abstractions for engine-agnostic synchronization.
//!
//! - [`schema`]: table, column and key metadata types
//! - [`value`]: owned SQL values and type families
//! - [`traits`]: `Dialect`, `Datasource` and `TableAccess`
//! - [`catalog`]: dialect registry for dependency injection
//! - [`identifier`]: identifier validation and quoting
//!
//! Driver modules (`drivers/postgres`, `drivers/mysql`, ...) implement these
//! traits; the sync engine is written against them only.

pub mod catalog;
pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use catalog::DialectRegistry;
pub use schema::{
    ColumnMetadata, KeyKind, KeyRange, KeyValue, TableMetadata, TableRef, TableSchemaMetadata,
};
pub use traits::{
    ConnectionInfo, Datasource, Dialect, IncrementalBound, PageQuery, PageRequest, TableAccess,
};
pub use value::{Row, SqlNullType, SqlValue, TypeFamily};
