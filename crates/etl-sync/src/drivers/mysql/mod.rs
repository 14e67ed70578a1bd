//! MySQL/MariaDB database driver.
//!
//! - [`MysqlDialect`]: SQL syntax strategy, shared by TiDB, PolarDB and StarRocks
//! - [`MysqlDatasource`]: SQLx pooled datasource
//!
//! # Supported Versions
//!
//! - MySQL 5.7+, 8.0+
//! - MariaDB 10.2+

mod datasource;
mod dialect;

pub use datasource::MysqlDatasource;
pub use dialect::MysqlDialect;
