//! Configuration validation.

use std::collections::HashSet;

use super::{Config, DatasourceType, MappingAction, StoreBackendKind, SyncMode};
use crate::core::identifier::{validate_filter_condition, validate_identifier};
use crate::drivers::common::SslMode;
use crate::error::{Result, SyncError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let mut codes = HashSet::new();
    for ds in &config.datasources {
        if ds.code.trim().is_empty() {
            return Err(SyncError::Config("datasource code is required".into()));
        }
        if !codes.insert(ds.code.as_str()) {
            return Err(SyncError::Config(format!(
                "duplicate datasource code '{}'",
                ds.code
            )));
        }
        if ds.host.is_empty() {
            return Err(SyncError::Config(format!(
                "datasources.{}.host is required",
                ds.code
            )));
        }
        if ds.database.is_empty() {
            return Err(SyncError::Config(format!(
                "datasources.{}.database is required",
                ds.code
            )));
        }
        if ds.user.is_empty() {
            return Err(SyncError::Config(format!(
                "datasources.{}.user is required",
                ds.code
            )));
        }
        SslMode::parse(ds.ssl_mode())?;
        if let Some(0) = ds.max_connections {
            return Err(SyncError::Config(format!(
                "datasources.{}.max_connections must be at least 1",
                ds.code
            )));
        }
    }

    if config.store.backend == StoreBackendKind::Postgres {
        let code = config.store.datasource.as_deref().ok_or_else(|| {
            SyncError::Config("store.datasource is required for the postgres backend".into())
        })?;
        match config.datasource(code) {
            Some(ds) if ds.r#type == DatasourceType::Postgres => {}
            Some(_) => {
                return Err(SyncError::Config(format!(
                    "store.datasource '{}' must be a postgres datasource",
                    code
                )))
            }
            None => {
                return Err(SyncError::Config(format!(
                    "store.datasource '{}' is not defined",
                    code
                )))
            }
        }
    }
    validate_identifier(&config.store.schema)?;

    let sync = &config.sync;
    for (name, value) in [
        ("bucket_parallelism", sync.bucket_parallelism),
        ("rows_per_bucket", sync.rows_per_bucket),
        ("max_buckets", sync.max_buckets),
        ("key_batch_size", sync.key_batch_size),
        ("upsert_batch_size", sync.upsert_batch_size),
    ] {
        if let Some(0) = value {
            return Err(SyncError::Config(format!("sync.{} must be at least 1", name)));
        }
    }
    if let Some(0) = sync.run_timeout_secs {
        return Err(SyncError::Config(
            "sync.run_timeout_secs must be at least 1".into(),
        ));
    }

    let mut ids = HashSet::new();
    for job in &config.jobs {
        validate_job(config, job, &mut ids)?;
    }

    Ok(())
}

fn validate_job<'a>(
    config: &Config,
    job: &'a super::SyncJob,
    ids: &mut HashSet<&'a str>,
) -> Result<()> {
    if job.id.trim().is_empty() {
        return Err(SyncError::Config("job id is required".into()));
    }
    if !ids.insert(job.id.as_str()) {
        return Err(SyncError::Config(format!("duplicate job id '{}'", job.id)));
    }
    for (side, code) in [("source", &job.source), ("target", &job.target)] {
        if config.datasource(code).is_none() {
            return Err(SyncError::Config(format!(
                "jobs.{}.{} references unknown datasource '{}'",
                job.id, side, code
            )));
        }
    }

    validate_identifier(&job.source_table)?;
    validate_identifier(&job.target_table)?;
    for schema in [&job.source_schema, &job.target_schema].into_iter().flatten() {
        if !schema.trim().is_empty() {
            validate_identifier(schema)?;
        }
    }

    match (job.sync_mode, &job.incremental_column) {
        (SyncMode::Incremental, None) => {
            return Err(SyncError::Config(format!(
                "jobs.{}.incremental_column is required for INCREMENTAL mode",
                job.id
            )))
        }
        (SyncMode::Full, Some(_)) => {
            return Err(SyncError::Config(format!(
                "jobs.{}.incremental_column is only allowed in INCREMENTAL mode",
                job.id
            )))
        }
        (_, Some(column)) => validate_identifier(column)?,
        _ => {}
    }

    if job.batch_size == 0 {
        return Err(SyncError::Config(format!(
            "jobs.{}.batch_size must be at least 1",
            job.id
        )));
    }
    if let Some(filter) = &job.filter_condition {
        validate_filter_condition(filter)?;
    }

    for rule in job.column_mappings.iter().filter(|r| r.enabled) {
        match rule.action {
            MappingAction::Copy | MappingAction::Skip if rule.source_column.is_none() => {
                return Err(SyncError::Config(format!(
                    "jobs.{}: {:?} mapping rule needs source_column",
                    job.id, rule.action
                )))
            }
            MappingAction::Constant if rule.constant_value.is_none() => {
                return Err(SyncError::Config(format!(
                    "jobs.{}: CONSTANT mapping rule needs constant_value",
                    job.id
                )))
            }
            MappingAction::Constant if rule.target_column.is_none() => {
                return Err(SyncError::Config(format!(
                    "jobs.{}: CONSTANT mapping rule needs target_column",
                    job.id
                )))
            }
            _ => {}
        }
        for column in [&rule.source_column, &rule.target_column].into_iter().flatten() {
            validate_identifier(column)?;
        }
    }

    Ok(())
}
