//! Generic ANSI fallback (SQL generation only).

pub mod dialect;

pub use dialect::GenericDialect;
