//! Error types for the sync engine.

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, bad identifiers, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A datasource could not be reached or dropped the connection.
    #[error("Datasource {datasource} unreachable: {message}")]
    Connectivity { datasource: String, message: String },

    /// No SQL generator is registered for the resolved engine family.
    #[error("No dialect registered for {0}")]
    UnsupportedDialect(String),

    /// The inspected table has no columns (missing or not visible).
    #[error("Table {0} not found or has no columns")]
    SchemaNotFound(String),

    /// A column required by the job disappeared from the source or target.
    #[error("Schema drift: {0}")]
    SchemaDrift(String),

    /// Bucketing requires an orderable primary key.
    #[error("Unsupported key for table {table}: {message}")]
    UnsupportedKeyType { table: String, message: String },

    /// A batch upsert kept failing after all retries.
    #[error("Batch write to {table} failed after {attempts} attempt(s): {message}")]
    BatchWrite {
        table: String,
        attempts: u32,
        message: String,
    },

    /// A statement failed for a reason other than connectivity.
    #[error("Query failed: {0}")]
    Query(String),

    /// The state backend rejected a read or write.
    #[error("State store error: {0}")]
    Store(String),

    /// The run exceeded its configured time limit.
    #[error("Run timed out after {0}s")]
    Timeout(u64),

    /// A run of the same job is already active and concurrent runs are disabled.
    #[error("Job {0} already has a run in progress")]
    RunInProgress(String),

    /// The run was cancelled (SIGINT, etc.)
    #[error("Run cancelled")]
    Cancelled,

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// MySQL driver error
    #[error("MySQL error: {0}")]
    MySql(#[from] sqlx::Error),

    /// SQL Server driver error
    #[error("SQL Server error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        SyncError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Connectivity error for a datasource.
    pub fn connectivity(datasource: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Connectivity {
            datasource: datasource.into(),
            message: message.to_string(),
        }
    }

    /// Create an UnsupportedKeyType error.
    pub fn unsupported_key(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::UnsupportedKeyType {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the datasource itself could not be used.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SyncError::Connectivity { .. } | SyncError::Pool { .. } => true,
            SyncError::Postgres(e) => e.is_closed() || e.code().is_none(),
            SyncError::MySql(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            ),
            SyncError::Mssql(e) => matches!(e, tiberius::error::Error::Io { .. }),
            _ => false,
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) => 2,
            e if e.is_connectivity() => 3,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<deadpool_postgres::PoolError> for SyncError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        SyncError::pool(e, "acquiring PostgreSQL connection")
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SyncError::Config("x".into()).exit_code(), 2);
        assert_eq!(SyncError::connectivity("src", "refused").exit_code(), 3);
        assert_eq!(SyncError::pool("timeout", "get").exit_code(), 3);
        assert_eq!(SyncError::Timeout(5).exit_code(), 1);
        assert_eq!(SyncError::SchemaDrift("gone".into()).exit_code(), 1);
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = SyncError::BatchWrite {
            table: "public.orders".into(),
            attempts: 3,
            message: "deadlock".into(),
        };
        let text = err.format_detailed();
        assert!(text.starts_with("Error: Batch write to public.orders failed after 3 attempt(s)"));
        assert!(text.contains("deadlock"));
    }

    #[test]
    fn test_format_detailed_walks_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config.yaml missing");
        let err = SyncError::from(io);
        assert!(err.format_detailed().contains("config.yaml missing"));
    }
}
