//! Microsoft SQL Server driver.
//!
//! - [`MssqlDialect`]: SQL syntax strategy for SQL Server
//! - [`MssqlDatasource`]: Tiberius + bb8 pooled datasource

mod datasource;
mod dialect;

pub use datasource::{MssqlDatasource, TiberiusConnectionManager};
pub use dialect::MssqlDialect;
