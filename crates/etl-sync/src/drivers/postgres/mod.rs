//! PostgreSQL driver.
//!
//! - [`PostgresDialect`]: SQL syntax strategy, shared by openGauss, KingbaseES and GaussDB
//! - [`PostgresDatasource`]: deadpool-postgres pooled datasource with rustls TLS

mod datasource;
mod dialect;

pub use datasource::PostgresDatasource;
pub use dialect::PostgresDialect;
