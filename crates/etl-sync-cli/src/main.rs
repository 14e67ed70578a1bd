//! etl-sync CLI - incremental table sync with bucketed validation.

use clap::{Parser, Subcommand};
use etl_sync::state::{BucketChecksum, ExecutionLog, SyncCheckpoint};
use etl_sync::{
    open_store, Config, ExecutionStatus, ReconciliationOrchestrator, RunOutcome, SyncError,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use uuid::Uuid;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code for a run that ended FAILED.
const EXIT_RUN_FAILED: u8 = 4;

#[derive(Parser)]
#[command(name = "etl-sync")]
#[command(about = "Incremental table sync with bucketed consistency validation")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync job
    Run {
        /// Job id from the configuration
        #[arg(long)]
        job: String,
    },

    /// Run every configured job concurrently
    RunAll,

    /// Show the checkpoint and recent executions of a job
    Status {
        /// Job id from the configuration
        #[arg(long)]
        job: String,

        /// Number of executions to list
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Show the bucket results of one execution
    Buckets {
        /// Execution id
        #[arg(long)]
        execution: Uuid,
    },

    /// Test database connections
    HealthCheck,

    /// Create the state store tables
    InitStore,

    /// Validate the configuration file without connecting
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, SyncError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = load_config(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Validate => {
            if cli.output_json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "valid": true,
                        "datasources": config.datasources.len(),
                        "jobs": config.jobs.len(),
                        "config_hash": config.hash(),
                    }))?
                );
            } else {
                println!("Configuration is valid");
                println!("  Datasources: {}", config.datasources.len());
                println!("  Jobs: {}", config.jobs.len());
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::InitStore => {
            let store = open_store(&config).await?;
            store.init_schema().await?;
            println!(
                "State store ready ({} backend, schema {})",
                store.backend_type(),
                config.store.schema
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status { job, limit } => {
            if config.job(&job).is_none() {
                return Err(SyncError::Config(format!("job '{}' is not defined", job)));
            }
            let store = open_store(&config).await?;
            let checkpoint = store.get_checkpoint(&job).await?;
            let executions = store.list_executions(&job, limit).await?;
            if cli.output_json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "job_id": job,
                        "checkpoint": checkpoint,
                        "executions": executions,
                    }))?
                );
            } else {
                print_status(&job, checkpoint.as_ref(), &executions);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Buckets { execution } => {
            let store = open_store(&config).await?;
            let buckets = store.list_bucket_checksums(execution).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&buckets)?);
            } else {
                print_buckets(execution, &buckets);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::HealthCheck => {
            let orchestrator = ReconciliationOrchestrator::connect(config).await?;
            let results = orchestrator.health_check().await;
            let healthy = results.iter().all(|(_, r)| r.is_ok());

            if cli.output_json {
                let datasources: Vec<_> = results
                    .iter()
                    .map(|(code, r)| {
                        json!({
                            "code": code,
                            "connected": r.is_ok(),
                            "error": r.as_ref().err().map(|e| e.to_string()),
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "healthy": healthy,
                        "datasources": datasources,
                    }))?
                );
            } else {
                println!("Health Check Results:");
                for (code, result) in &results {
                    match result {
                        Ok(()) => println!("  {}: OK", code),
                        Err(e) => println!("  {}: FAILED\n    Error: {}", code, e),
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            match results.into_iter().find_map(|(_, r)| r.err()) {
                Some(e) => Err(e),
                None => Ok(ExitCode::SUCCESS),
            }
        }

        Commands::Run { job } => {
            let cancel_token = setup_signal_handler();
            let orchestrator = ReconciliationOrchestrator::connect(config.with_auto_tuning())
                .await?
                .with_cancellation(cancel_token);
            let outcome = orchestrator.execute(&job).await?;
            report_outcomes(&[outcome], cli.output_json)
        }

        Commands::RunAll => {
            let cancel_token = setup_signal_handler();
            let orchestrator = Arc::new(
                ReconciliationOrchestrator::connect(config.with_auto_tuning())
                    .await?
                    .with_cancellation(cancel_token),
            );
            let mut outcomes = Vec::new();
            for (job_id, result) in orchestrator.execute_all().await {
                match result {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        eprintln!("Job {} did not run: {}", job_id, e);
                        return Err(e);
                    }
                }
            }
            report_outcomes(&outcomes, cli.output_json)
        }
    }
}

/// A missing or unreadable file is a configuration problem.
fn load_config(path: &Path) -> Result<Config, SyncError> {
    Config::load(path).map_err(|e| match e {
        SyncError::Io(io) => {
            SyncError::Config(format!("cannot read {}: {}", path.display(), io))
        }
        other => other,
    })
}

fn report_outcomes(outcomes: &[RunOutcome], output_json: bool) -> Result<ExitCode, SyncError> {
    if output_json {
        let value = match outcomes {
            [single] => serde_json::to_value(single)?,
            many => serde_json::to_value(many)?,
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for outcome in outcomes {
            print_outcome(outcome);
        }
    }

    if outcomes
        .iter()
        .any(|o| o.status == ExecutionStatus::Failed)
    {
        Ok(ExitCode::from(EXIT_RUN_FAILED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn print_outcome(outcome: &RunOutcome) {
    println!("\nJob {} finished: {}", outcome.job_id, outcome.status);
    println!("  Execution: {}", outcome.execution_id);
    println!("  Duration: {:.2}s", outcome.duration_ms as f64 / 1000.0);
    println!(
        "  Rows: {} extracted, {} loaded, {} repaired, {} failed",
        outcome.extracted_rows, outcome.loaded_rows, outcome.repaired_rows, outcome.failed_rows
    );
    println!(
        "  Buckets: {} total, {} mismatched, {} need sync",
        outcome.bucket_count, outcome.initial_mismatches, outcome.needs_sync
    );
    println!("  Validation: {}", outcome.validation_status);
    if let Some(ref watermark) = outcome.watermark {
        println!("  Watermark: {}", watermark);
    }
    if let Some(ref err) = outcome.error {
        println!("  Error: {}", err);
    }
}

fn print_status(job: &str, checkpoint: Option<&SyncCheckpoint>, executions: &[ExecutionLog]) {
    println!("Job {}", job);
    match checkpoint {
        None => println!("  No runs recorded"),
        Some(cp) => {
            println!("  Validation: {}", cp.validation_status);
            println!(
                "  Watermark: {}",
                cp.last_incremental_value.as_deref().unwrap_or("-")
            );
            if let Some(time) = cp.last_sync_time {
                println!("  Last sync: {}", time.to_rfc3339());
            }
            println!(
                "  Rows: {} source, {} target",
                cp.source_row_count, cp.target_row_count
            );
            println!(
                "  Buckets: {} applied, {} skipped",
                cp.applied_bucket_count, cp.skipped_bucket_count
            );
        }
    }

    if !executions.is_empty() {
        println!("\nRecent executions:");
        for log in executions {
            println!(
                "  {}  {}  {:<15}  {} loaded, {} repaired",
                log.id,
                log.started_at.format("%Y-%m-%d %H:%M:%S"),
                log.status,
                log.loaded_rows,
                log.repaired_rows
            );
        }
    }
}

fn print_buckets(execution: Uuid, buckets: &[BucketChecksum]) {
    if buckets.is_empty() {
        println!("No buckets recorded for execution {}", execution);
        return;
    }
    println!("Buckets of execution {}:", execution);
    for b in buckets {
        let state = match (b.needs_sync, b.skip_reason) {
            (false, None) => "MATCHED".to_string(),
            (_, Some(reason)) => reason.to_string(),
            (true, None) => "NEEDS_SYNC".to_string(),
        };
        println!(
            "  #{:<4} [{}, {})  rows {}/{}  retries {}  {}",
            b.bucket_number,
            b.boundary_start,
            b.boundary_end.as_deref().unwrap_or("∞"),
            b.source_row_count,
            b.target_row_count,
            b.retry_count,
            state
        );
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel active runs on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Cancelling active runs...", name);
                    token.cancel();
                });
            }
            Err(e) => eprintln!("Could not install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Cancel active runs on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Cancelling active runs...");
            token.cancel();
        }
    });

    cancel_token
}
