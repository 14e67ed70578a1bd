//! Oracle support (SQL generation only; no bundled driver).

pub mod dialect;

pub use dialect::OracleDialect;
