//! CLI integration tests for etl-sync.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for conditions that need no live database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

/// Get a command for the etl-sync binary.
fn cmd() -> Command {
    Command::cargo_bin("etl-sync").unwrap()
}

const VALID_CONFIG: &str = r#"
datasources:
  - code: erp
    type: postgres
    host: 127.0.0.1
    port: 1
    database: erp
    user: etl
    ssl_mode: disable
  - code: dw
    type: mysql
    host: 127.0.0.1
    port: 1
    database: dw
    user: etl
jobs:
  - id: orders
    source: erp
    source_table: orders
    target: dw
    target_table: orders
    sync_mode: INCREMENTAL
    incremental_column: updated_at
"#;

fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", content).unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("run-all"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("buckets"))
        .stdout(predicate::str::contains("health-check"))
        .stdout(predicate::str::contains("init-store"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_run_requires_job() {
    cmd()
        .args(["run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--job"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("etl-sync"));
}

#[test]
fn test_global_flag_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: config.yaml]"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("--output-json"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests - Config Errors (Exit Code 2)
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_2() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "validate"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let file = config_file("invalid: yaml: content: [\n");
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(2);
}

#[test]
fn test_unknown_datasource_reference_exits_with_code_2() {
    let file = config_file(&VALID_CONFIG.replace("target: dw", "target: warehouse"));
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("warehouse"));
}

#[test]
fn test_incremental_job_without_column_exits_with_code_2() {
    let file = config_file(&VALID_CONFIG.replace("    incremental_column: updated_at\n", ""));
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(2);
}

#[test]
fn test_status_of_unknown_job_exits_with_code_2() {
    let file = config_file(VALID_CONFIG);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "status", "--job", "ghost"])
        .assert()
        .code(2);
}

// =============================================================================
// Commands that run without a database
// =============================================================================

#[test]
fn test_validate_valid_config() {
    let file = config_file(VALID_CONFIG);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Jobs: 1"));
}

#[test]
fn test_validate_json_output() {
    let file = config_file(VALID_CONFIG);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "--output-json", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\": true"))
        .stdout(predicate::str::contains("\"config_hash\""));
}

#[test]
fn test_status_with_memory_store_has_no_history() {
    let file = config_file(VALID_CONFIG);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "status", "--job", "orders"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded"));
}

#[test]
fn test_buckets_with_memory_store_is_empty() {
    let file = config_file(VALID_CONFIG);
    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--output-json",
            "buckets",
            "--execution",
            "6f1c2a8e-3b7d-4e51-9a0c-1d2e3f405162",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_buckets_rejects_malformed_execution_id() {
    let file = config_file(VALID_CONFIG);
    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "buckets",
            "--execution",
            "not-a-uuid",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--execution"));
}

#[test]
fn test_init_store_memory_backend() {
    let file = config_file(VALID_CONFIG);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "init-store"])
        .assert()
        .success()
        .stdout(predicate::str::contains("memory backend"));
}

// =============================================================================
// Exit Code Tests - Connectivity Errors (Exit Code 3)
// =============================================================================

#[test]
fn test_unreachable_datasource_exits_with_code_3() {
    let file = config_file(VALID_CONFIG);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run", "--job", "orders"])
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .code(3)
        .stderr(predicate::str::contains("erp"));
}
