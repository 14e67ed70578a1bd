//! # etl-sync
//!
//! Incremental table synchronization with bucketed consistency validation.
//!
//! This library copies rows from a source table to a target table across
//! database engines and then proves the two agree:
//!
//! - **Incremental extraction** driven by a persisted watermark column
//! - **Dialect-aware SQL** for PostgreSQL, MySQL, SQL Server and Oracle
//! - **Bucketed checksums** over the primary-key space with targeted repair
//! - **Run history** of executions, bucket results and schema snapshots
//!
//! ## Example
//!
//! ```rust,no_run
//! use etl_sync::{Config, ReconciliationOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> etl_sync::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = ReconciliationOrchestrator::connect(config).await?;
//!     let outcome = orchestrator.execute("orders").await?;
//!     println!("{}: {} rows loaded", outcome.status, outcome.loaded_rows);
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod config;
pub mod core;
pub mod dialect;
pub mod drivers;
pub mod error;
pub mod mapping;
pub mod metadata;
pub mod orchestrator;
pub mod state;
pub mod verify;

#[cfg(test)]
mod test_utils;

// Re-exports for convenient access
pub use config::{Config, DatasourceConfig, SyncConfig, SyncJob, SyncMode};
pub use error::{Result, SyncError};
pub use orchestrator::{open_store, ReconciliationOrchestrator, RunOutcome};
pub use state::{ExecutionStatus, StateBackend, ValidationStatus};
pub use verify::{BucketChecksumEngine, BucketReport};
