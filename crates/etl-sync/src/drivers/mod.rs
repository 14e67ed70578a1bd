//! Database driver implementations.
//!
//! One module per engine family:
//!
//! - [`postgres`]: PostgreSQL dialect and datasource (tokio-postgres + deadpool)
//! - [`mysql`]: MySQL/MariaDB dialect and datasource (SQLx)
//! - [`mssql`]: SQL Server dialect and datasource (Tiberius + bb8)
//! - [`oracle`]: Oracle dialect (SQL generation only)
//! - [`generic`]: ANSI fallback dialect
//! - [`common`]: Shared utilities (TLS)
//!
//! [`DatasourceRegistry`] maps datasource codes from configuration to live,
//! pooled connections. It is built once by the composition root.
//!
//! # Adding New Databases
//!
//! 1. Create a new module under `drivers/` with a `Dialect` implementation
//! 2. Add a variant to `DialectKind` and `DialectImpl` and its resolver keywords
//! 3. If a Rust driver exists, implement `Datasource` and add a `DatasourceType`

pub mod common;
pub mod generic;
pub mod mssql;
pub mod mysql;
pub mod oracle;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

pub use common::{SslMode, TlsBuilder};
pub use generic::GenericDialect;
pub use mssql::{MssqlDatasource, MssqlDialect};
pub use mysql::{MysqlDatasource, MysqlDialect};
pub use oracle::OracleDialect;
pub use postgres::{PostgresDatasource, PostgresDialect};

use crate::config::{DatasourceConfig, DatasourceType};
use crate::core::traits::Datasource;
use crate::error::{Result, SyncError};

/// Open a pooled connection for one configured datasource.
pub async fn connect_datasource(config: &DatasourceConfig) -> Result<Arc<dyn Datasource>> {
    let datasource: Arc<dyn Datasource> = match config.r#type {
        DatasourceType::Postgres => Arc::new(PostgresDatasource::connect(config).await?),
        DatasourceType::Mysql => Arc::new(MysqlDatasource::connect(config).await?),
        DatasourceType::Mssql => Arc::new(MssqlDatasource::connect(config).await?),
    };
    Ok(datasource)
}

/// Datasource code → live connection.
#[derive(Default, Clone)]
pub struct DatasourceRegistry {
    datasources: HashMap<String, Arc<dyn Datasource>>,
}

impl DatasourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every given datasource.
    pub async fn connect<'a>(
        configs: impl IntoIterator<Item = &'a DatasourceConfig>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(connect_datasource(config).await?);
        }
        info!("Connected {} datasource(s)", registry.datasources.len());
        Ok(registry)
    }

    /// Register (or replace) a datasource under its own code.
    pub fn register(&mut self, datasource: Arc<dyn Datasource>) {
        self.datasources
            .insert(datasource.code().to_string(), datasource);
    }

    /// Look up a datasource; an unknown code is a connectivity failure.
    pub fn get(&self, code: &str) -> Result<Arc<dyn Datasource>> {
        self.datasources
            .get(code)
            .cloned()
            .ok_or_else(|| SyncError::connectivity(code, "datasource is not registered"))
    }

    /// Registered codes, sorted.
    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<_> = self.datasources.keys().cloned().collect();
        codes.sort();
        codes
    }
}
