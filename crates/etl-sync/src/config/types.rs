//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::core::schema::TableRef;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named connections referenced by jobs and the store.
    pub datasources: Vec<DatasourceConfig>,

    /// Where checkpoints and run history are kept.
    #[serde(default)]
    pub store: StoreConfig,

    /// Engine-wide defaults.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Sync job definitions.
    #[serde(default)]
    pub jobs: Vec<SyncJob>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.sync = self.sync.with_auto_tuning(&resources);
        self
    }

    /// Look up a datasource by code.
    pub fn datasource(&self, code: &str) -> Option<&DatasourceConfig> {
        self.datasources.iter().find(|d| d.code == code)
    }

    /// Look up a job by id.
    pub fn job(&self, id: &str) -> Option<&SyncJob> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

/// Database engine behind a datasource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceType {
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "mariadb")]
    Mysql,
    #[serde(alias = "sqlserver")]
    Mssql,
}

impl DatasourceType {
    pub fn default_port(&self) -> u16 {
        match self {
            DatasourceType::Postgres => 5432,
            DatasourceType::Mysql => 3306,
            DatasourceType::Mssql => 1433,
        }
    }

    fn url_scheme(&self) -> &'static str {
        match self {
            DatasourceType::Postgres => "postgresql",
            DatasourceType::Mysql => "mysql",
            DatasourceType::Mssql => "sqlserver",
        }
    }
}

/// One named database connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatasourceConfig {
    /// Code jobs use to reference this datasource.
    pub code: String,

    #[serde(rename = "type")]
    pub r#type: DatasourceType,

    pub host: String,

    /// Defaults to the engine's standard port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// disable, require, verify-ca or verify-full. Defaults to require for
    /// PostgreSQL and SQL Server and to disable for MySQL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_mode: Option<String>,

    /// Overrides the product name reported by the server for dialect
    /// resolution (e.g. "openGauss" behind a PostgreSQL wire protocol).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,

    /// Connection pool size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl DatasourceConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.r#type.default_port())
    }

    /// Effective ssl_mode string.
    pub fn ssl_mode(&self) -> &str {
        match (&self.ssl_mode, self.r#type) {
            (Some(mode), _) => mode,
            (None, DatasourceType::Mysql) => "disable",
            (None, _) => "require",
        }
    }

    pub fn get_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(8)
    }

    /// Connection URL without credentials, used for logging and dialect
    /// resolution.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}/{}",
            self.r#type.url_scheme(),
            self.host,
            self.port(),
            self.database
        )
    }
}

impl fmt::Debug for DatasourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasourceConfig")
            .field("code", &self.code)
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode())
            .field("product", &self.product)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// State backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// Tables in a PostgreSQL datasource.
    Postgres,
    /// Process memory; history is lost on exit.
    #[default]
    Memory,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// Datasource code hosting the store (postgres backend only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<String>,

    /// Schema holding the state tables.
    #[serde(default = "default_store_schema")]
    pub schema: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            datasource: None,
            schema: default_store_schema(),
        }
    }
}

/// Engine defaults shared by all jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Buckets scored concurrently. Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_parallelism: Option<usize>,

    /// Target rows per bucket when choosing the bucket count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_per_bucket: Option<usize>,

    /// Upper bound on buckets per table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_buckets: Option<usize>,

    /// Keys per `SELECT ... WHERE pk IN (...)` during repair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_batch_size: Option<usize>,

    /// Rows per upsert statement batch during repair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upsert_batch_size: Option<usize>,

    /// Wall-clock limit for one run, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,

    /// Delete target rows whose key no longer exists on the source.
    #[serde(default)]
    pub delete_orphans: bool,

    /// Clear the target before a FULL extraction.
    #[serde(default)]
    pub truncate_before_full: bool,

    /// Add mapped columns missing on the target instead of failing.
    #[serde(default)]
    pub auto_add_columns: bool,
}

impl SyncConfig {
    /// Apply auto-tuned defaults based on system resources.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.bucket_parallelism.is_none() {
            self.bucket_parallelism = Some(resources.cpu_cores.clamp(2, 16));
        }
        info!(
            "Auto-tuned sync config: bucket_parallelism={}, rows_per_bucket={}, max_buckets={}",
            self.get_bucket_parallelism(),
            self.get_rows_per_bucket(),
            self.get_max_buckets()
        );
        self
    }

    pub fn get_bucket_parallelism(&self) -> usize {
        self.bucket_parallelism.unwrap_or(4)
    }

    pub fn get_rows_per_bucket(&self) -> usize {
        self.rows_per_bucket.unwrap_or(1_000)
    }

    pub fn get_max_buckets(&self) -> usize {
        self.max_buckets.unwrap_or(1_024)
    }

    pub fn get_key_batch_size(&self) -> usize {
        self.key_batch_size.unwrap_or(900)
    }

    pub fn get_upsert_batch_size(&self) -> usize {
        self.upsert_batch_size.unwrap_or(500)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Extraction mode of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncMode {
    #[default]
    #[serde(alias = "full")]
    Full,
    #[serde(alias = "incremental")]
    Incremental,
}

/// What a mapping rule does with its source column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MappingAction {
    #[default]
    #[serde(alias = "copy")]
    Copy,
    #[serde(alias = "skip")]
    Skip,
    #[serde(alias = "constant")]
    Constant,
}

/// Column-level transformation between source and target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMappingRule {
    /// Source column (COPY, SKIP).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_column: Option<String>,

    /// Target column (COPY, CONSTANT). Defaults to the source column name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,

    #[serde(default)]
    pub action: MappingAction,

    /// Literal written by CONSTANT rules, parsed as the target column type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant_value: Option<String>,

    /// Application order.
    #[serde(default)]
    pub ordinal: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Definition of one source → target sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Source datasource code.
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_schema: Option<String>,

    pub source_table: String,

    /// Target datasource code.
    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_schema: Option<String>,

    pub target_table: String,

    #[serde(default)]
    pub sync_mode: SyncMode,

    /// Monotonic column driving INCREMENTAL extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_column: Option<String>,

    /// Rows per extraction page and upsert batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per failing batch, and the default bucket repair budget.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Allow a new run while one of this job is active.
    #[serde(default)]
    pub concurrent_allowed: bool,

    /// Trusted SQL predicate ANDed into source queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_condition: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_mappings: Vec<ColumnMappingRule>,

    /// Repair attempts per bucket; falls back to `retry_count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_retry_count: Option<u32>,

    /// Base delay between bucket repairs; falls back to `retry_interval_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_retry_interval_ms: Option<u64>,
}

impl SyncJob {
    pub fn source_table_ref(&self) -> TableRef {
        TableRef::new(self.source_schema.as_deref(), self.source_table.as_str())
    }

    pub fn target_table_ref(&self) -> TableRef {
        TableRef::new(self.target_schema.as_deref(), self.target_table.as_str())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Delay between failed batch attempts.
    pub fn batch_retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Repair attempts per mismatched bucket, at least 1.
    pub fn bucket_retry_count(&self) -> u32 {
        self.bucket_retry_count.unwrap_or(self.retry_count).max(1)
    }

    /// Base delay between bucket repair attempts.
    pub fn bucket_retry_interval(&self) -> Duration {
        match self.bucket_retry_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.retry_interval_secs),
        }
    }
}

fn default_store_schema() -> String {
    "_etl_sync".to_string()
}

fn default_batch_size() -> usize {
    1_000
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_interval_secs() -> u64 {
    1
}

fn default_true() -> bool {
    true
}
