//! hass-pg-migrate CLI - Home Assistant recorder migration from MySQL to PostgreSQL.

use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use hass_pg_migrate::progress::FileProgressBackend;
use hass_pg_migrate::{
    backup_target, find_table, health_check, recorder_tables, Config, MigrateError,
    MigrationResult, Orchestrator, RunOptions, ValidationReport,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "hass-pg-migrate")]
#[command(about = "Migrate a Home Assistant recorder database from MySQL to PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the progress file (overrides migration.progress_file)
    #[arg(long)]
    progress_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for in-flight batches after a shutdown signal
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a fresh migration of all tables (truncates the target tables)
    Run {
        /// Override rows per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Override number of tables migrated concurrently
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,

        /// Dump the target database with pg_dump before truncating it
        #[arg(long)]
        backup: bool,

        /// Directory for the backup file
        #[arg(long, default_value = "backups", requires = "backup")]
        backup_dir: PathBuf,
    },

    /// Continue an interrupted migration from the progress file
    Resume {
        /// Override rows per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Override number of tables migrated concurrently
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Migrate a single table
    Table {
        /// Table name, see `tables`
        name: String,

        /// Override rows per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,

        /// Keep rows already in the target table instead of truncating it
        #[arg(long)]
        keep_existing: bool,
    },

    /// Compare row counts between source and target
    Validate {
        /// Only validate this table
        #[arg(long)]
        table: Option<String>,
    },

    /// Show the progress file
    Progress,

    /// List the tables that are migrated, in dependency order
    Tables,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    // Catalog listing needs neither configuration nor logging
    if let Commands::Tables = cli.command {
        return print_tables(cli.output_json);
    }

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);
    if let Some(path) = cli.progress_file.clone() {
        config.migration.progress_file = path;
    }

    match cli.command {
        Commands::Tables => unreachable!(), // Handled above
        Commands::Run {
            batch_size,
            max_concurrency,
            yes,
            backup,
            backup_dir,
        } => {
            apply_overrides(&mut config, batch_size, max_concurrency)?;
            if !yes
                && !confirm(&format!(
                    "This truncates every recorder table in PostgreSQL database '{}'. Continue?",
                    config.target.database
                ))?
            {
                println!("Aborted.");
                return Ok(());
            }

            if backup {
                if let Err(e) = backup_target(&config.target, &backup_dir).await {
                    warn!("Backup failed, continuing without one: {}", e);
                }
            }

            let cancel_token = setup_signal_handler(cli.shutdown_timeout);
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.run(RunOptions::fresh(), &cancel_token).await;
            orchestrator.close().await;
            report_run(&result?, cli.output_json)?;
        }

        Commands::Resume {
            batch_size,
            max_concurrency,
        } => {
            apply_overrides(&mut config, batch_size, max_concurrency)?;
            let progress_file = config.migration.progress_file.clone();
            if !progress_file.exists() {
                return Err(MigrateError::Config(format!(
                    "Progress file not found: {:?}. Use `run` to start a migration",
                    progress_file
                )));
            }

            let cancel_token = setup_signal_handler(cli.shutdown_timeout);
            let orchestrator = Orchestrator::new(config).await?;
            info!("Resuming from {:?}", progress_file);
            let result = orchestrator.run(RunOptions::resume(), &cancel_token).await;
            orchestrator.close().await;
            report_run(&result?, cli.output_json)?;
        }

        Commands::Table {
            name,
            batch_size,
            yes,
            keep_existing,
        } => {
            apply_overrides(&mut config, batch_size, None)?;
            if find_table(&name).is_none() {
                return Err(MigrateError::UnknownTable(name));
            }
            let prompt = if keep_existing {
                format!("Migrate table '{}' keeping existing target rows. Continue?", name)
            } else {
                format!("This truncates table '{}' in PostgreSQL. Continue?", name)
            };
            if !yes && !confirm(&prompt)? {
                println!("Aborted.");
                return Ok(());
            }

            let cancel_token = setup_signal_handler(cli.shutdown_timeout);
            let orchestrator = Orchestrator::new(config).await?;
            let options = RunOptions::fresh()
                .with_tables(vec![name])
                .with_truncate(!keep_existing);
            let result = orchestrator.run(options, &cancel_token).await;
            orchestrator.close().await;
            report_run(&result?, cli.output_json)?;
        }

        Commands::Validate { table } => {
            let orchestrator = Orchestrator::new(config).await?;
            let tables = table.map(|t| vec![t]);
            let report = orchestrator.validate(tables.as_deref()).await;
            orchestrator.close().await;
            let report = report?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_validation(&report);
            }
            if !report.all_match() {
                return Err(MigrateError::Incomplete(format!(
                    "{} tables failed validation",
                    report.problems().len()
                )));
            }
        }

        Commands::Progress => {
            let path = &config.migration.progress_file;
            if !path.exists() {
                println!("No progress file at {:?}", path);
                return Ok(());
            }
            let records = FileProgressBackend::read(path).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                println!("Progress ({:?}):", path);
                for (table, record) in &records {
                    let percent = record
                        .percent()
                        .map_or_else(|| "-".to_string(), |p| format!("{:.1}%", p));
                    let last_key = record
                        .last_key
                        .as_ref()
                        .map_or_else(|| "-".to_string(), |k| k.to_string());
                    println!(
                        "  {:<24} {:<12} {:>7}  {} rows  last key {}",
                        table, record.status.as_str(), percent, record.rows_written, last_key
                    );
                    if let Some(ref err) = record.error {
                        println!("    Error: {}", err);
                    }
                }
            }
        }

        Commands::HealthCheck => {
            let result = health_check(&config).await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MySQL): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::pool("health check failed", "connecting to databases"));
            }
        }
    }

    Ok(())
}

fn apply_overrides(
    config: &mut Config,
    batch_size: Option<usize>,
    max_concurrency: Option<usize>,
) -> Result<(), MigrateError> {
    if let Some(n) = batch_size {
        config.migration.batch_size = n;
    }
    if let Some(n) = max_concurrency {
        config.migration.max_concurrency = n;
    }
    config.validate()
}

fn confirm(prompt: &str) -> Result<bool, MigrateError> {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| MigrateError::Config(format!("confirmation failed: {} (use --yes)", e)))
}

fn print_tables(json: bool) -> Result<(), MigrateError> {
    let tables = recorder_tables();
    if json {
        println!("{}", serde_json::to_string_pretty(&tables)?);
        return Ok(());
    }
    println!("{:<24} {:<12} {:<16} depends on", "table", "category", "key");
    for table in &tables {
        let deps = if table.dependencies.is_empty() {
            "-".to_string()
        } else {
            table.dependencies.join(", ")
        };
        println!(
            "{:<24} {:<12} {:<16} {}",
            table.name,
            table.category.to_string(),
            table.key_column,
            deps
        );
    }
    Ok(())
}

fn print_validation(report: &ValidationReport) {
    println!("Validation:");
    for table in &report.tables {
        let count = |n: Option<i64>| n.map_or_else(|| "?".to_string(), |n| n.to_string());
        println!(
            "  {:<24} source={:<10} target={:<10} {:?}",
            table.table,
            count(table.source_rows),
            count(table.target_rows),
            table.status
        );
        if let Some(ref err) = table.error {
            println!("    Error: {}", err);
        }
    }
}

/// Print the run summary and turn an unsuccessful run into an error.
fn report_run(result: &MigrationResult, json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", result.to_json()?);
    } else {
        println!("\nMigration {}!", result.status);
        println!("  Run ID: {}", result.run_id);
        println!("  Duration: {:.2}s", result.duration_seconds);
        println!("  Tables: {}/{}", result.tables_success, result.tables_total);
        println!("  Rows: {}", result.rows_transferred);
        if result.rows_rejected > 0 {
            println!("  Rejected rows: {}", result.rows_rejected);
        }
        println!("  Throughput: {} rows/sec", result.rows_per_second);
        if !result.failed_tables.is_empty() {
            println!("  Failed tables: {:?}", result.failed_tables);
        }
        if !result.blocked_tables.is_empty() {
            println!("  Blocked tables: {:?}", result.blocked_tables);
        }
        if let Some(ref validation) = result.validation {
            print_validation(validation);
        }
    }

    match result.outcome_error() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("invalid verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("invalid log format '{}'", other)),
    }

    Ok(())
}

/// Exit once the grace period after a shutdown signal has passed.
fn spawn_shutdown_deadline(token: CancellationToken, shutdown_timeout: u64) {
    tokio::spawn(async move {
        token.cancelled().await;
        tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
        eprintln!(
            "Shutdown timeout of {}s exceeded; exiting. Progress of committed batches is kept.",
            shutdown_timeout
        );
        std::process::exit(i32::from(hass_pg_migrate::error::EXIT_CANCELLED));
    });
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
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
                    eprintln!(
                        "\nReceived {}. Finishing in-flight batches (timeout: {}s)...",
                        name, shutdown_timeout
                    );
                    token.cancel();
                });
            }
            Err(e) => warn!("Could not install {} handler: {}", name, e),
        }
    }

    spawn_shutdown_deadline(cancel_token.clone(), shutdown_timeout);
    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Finishing in-flight batches...");
                token.cancel();
            }
            Err(e) => warn!("Could not install Ctrl-C handler: {}", e),
        }
    });

    spawn_shutdown_deadline(cancel_token.clone(), shutdown_timeout);
    cancel_token
}
