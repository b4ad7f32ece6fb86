//! psc CLI - chunked, resumable PostgreSQL copy and data-fix runner.

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use psc::copy::{CopyOperation, CopyOptions, TableSpec};
use psc::progress::ProgressEvent;
use psc::statement::StatementRunner;
use psc::{PscError, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "psc")]
#[command(about = "Chunked, resumable PostgreSQL table copy and data-fix runner")]
#[command(version)]
struct Cli {
    /// Service file path (default: $PGSERVICEFILE or ~/.pg_service.conf)
    #[arg(long, global = true)]
    service_file: Option<PathBuf>,

    /// Log format: text or json
    #[arg(long, default_value = "text", global = true)]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info", global = true)]
    verbosity: String,

    /// Output JSON result to stdout
    #[arg(long, global = true)]
    output_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a table from one service to another
    Copy {
        /// Source service name from the service file
        source: String,

        /// Target service name from the service file
        target: String,

        /// Table to copy (must already exist on the target)
        table: String,

        /// Row filter ANDed with the range predicate
        #[arg(long = "where")]
        where_filter: Option<String>,

        /// Numeric key column used for chunking
        #[arg(long, default_value = "id")]
        primary_key: String,

        /// Resume copy from this key (the persisted resume point wins if higher)
        #[arg(long, default_value_t = 0)]
        last_id: i64,

        /// Rows per chunk
        #[arg(long, default_value_t = 1000)]
        chunk_size: i64,

        /// Number of parallel workers
        #[arg(long, default_value_t = 1)]
        parallelism: usize,

        /// Semicolon-separated SQL run on the target before the copy
        #[arg(long)]
        target_setup: Option<String>,

        /// Directory for in_progress/ and completed/ state files
        #[arg(long, default_value = ".")]
        state_dir: PathBuf,

        /// Print per-chunk progress lines to stderr
        #[arg(long)]
        progress: bool,
    },

    /// Show migration records and resumable copy operations
    Status {
        /// Migrations repository directory
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// State database service name
        #[arg(long)]
        service: String,

        /// Directory holding copy state files
        #[arg(long, default_value = ".")]
        state_dir: PathBuf,
    },

    /// Run a named migration from the repository
    Run {
        /// Migration name (from its 'psc: migrate name=' directive)
        name: String,

        /// Migrations repository directory
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// State database service name (also the default target)
        #[arg(long)]
        service: String,

        /// Print per-chunk progress lines to stderr
        #[arg(long)]
        progress: bool,
    },

    /// Mark a running migration as cancelled
    Cancel {
        /// Migration name
        name: String,

        /// State database service name
        #[arg(long)]
        service: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Operand errors exit 1; --help and --version exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    setup_logging(&cli.verbosity, &cli.log_format)?;

    let cancel = setup_signal_handler()?;

    match cli.command {
        Commands::Copy {
            source,
            target,
            table,
            where_filter,
            primary_key,
            last_id,
            chunk_size,
            parallelism,
            target_setup,
            state_dir,
            progress,
        } => {
            let mut options = CopyOptions::new(&source, &target);
            options.chunk_size = chunk_size;
            options.parallelism = parallelism;
            options.target_setup = target_setup;
            options.state_dir = state_dir;
            options.service_file = cli.service_file;

            let mut spec = TableSpec::new(&table, &primary_key);
            spec.where_filter = where_filter;
            spec.start_key = last_id;

            let mut operation = CopyOperation::new(options, vec![spec]).await?;

            let resume_point = operation.state().last_id_for(&table).unwrap_or(0);
            if resume_point > 0 {
                info!("resuming copy of '{}' at key {}", table, resume_point);
            }

            let progress_tx = progress.then(spawn_progress_printer);
            let summary = operation.run(cancel, progress_tx).await?;

            if cli.output_json {
                println!("{}", summary.to_json()?);
            } else {
                println!("\nCopy completed!");
                println!("  Rows: {}", format_number(summary.rows_copied));
                println!("  Duration: {:.2}s", summary.duration_seconds);
                for outcome in &summary.tables {
                    println!(
                        "  {}: {} rows, last key {}",
                        outcome.table_name,
                        format_number(outcome.rows_copied),
                        outcome.last_id
                    );
                }
            }
        }

        Commands::Status {
            repo,
            service,
            state_dir,
        } => {
            print_resumable_copies(&state_dir)?;

            let runner = StatementRunner::connect(&service, cli.service_file.as_deref()).await?;
            let scan = runner.sync_repo(&repo).await?;
            for err in &scan.errors {
                eprintln!("warning: {}", err);
            }

            let records = runner.store().list().await?;
            if records.is_empty() {
                println!("No migrations registered.");
                return Ok(());
            }

            println!(
                "{:<30} {:<10} {:>16} {:>16} {:>7}",
                "NAME", "STATUS", "LAST KEY", "AFFECTED", "ERRORS"
            );
            for record in records {
                let last_key = match record.max_key {
                    Some(max) => format!("{}/{}", record.last_completed_key, max),
                    None => record.last_completed_key.to_string(),
                };
                println!(
                    "{:<30} {:<10} {:>16} {:>16} {:>7}",
                    record.name,
                    record.status.as_str(),
                    last_key,
                    format_number(record.total_affected),
                    record.error_count
                );
                if let Some(err) = &record.last_error {
                    println!("    last error: {}", err);
                }
            }
        }

        Commands::Run {
            name,
            repo,
            service,
            progress,
        } => {
            let runner = StatementRunner::connect(&service, cli.service_file.as_deref()).await?;
            let scan = runner.sync_repo(&repo).await?;
            for err in &scan.errors {
                eprintln!("warning: {}", err);
            }

            let migration = scan
                .migrations
                .iter()
                .find(|m| m.name == name)
                .ok_or_else(|| {
                    PscError::Config(format!(
                        "migration '{}' not found in {}",
                        name,
                        repo.display()
                    ))
                })?;

            let progress_tx = progress.then(spawn_progress_printer);
            let outcome = runner.run(migration, cancel, progress_tx).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("\nMigration '{}' {}!", outcome.name, outcome.status);
                println!("  Affected: {}", format_number(outcome.total_affected));
                if let Some(max) = outcome.max_key {
                    println!("  Keys: {}/{}", outcome.last_key, max);
                }
                if outcome.error_count > 0 {
                    println!("  Errors: {}", outcome.error_count);
                }
                println!("  Duration: {:.2}s", outcome.duration_seconds);
            }
        }

        Commands::Cancel { name, service } => {
            let runner = StatementRunner::connect(&service, cli.service_file.as_deref()).await?;
            runner.cancel(&name).await?;
            println!("Migration '{}' cancelled.", name);
        }
    }

    Ok(())
}

/// List interrupted copy operations with the command that resumes each one.
fn print_resumable_copies(state_dir: &std::path::Path) -> Result<()> {
    let store = psc::copy::state::StateStore::new(state_dir);
    let found = store.list_in_progress()?;
    if found.is_empty() {
        return Ok(());
    }

    println!("Found {} copy operation(s) in progress:", found.len());
    for (path, state) in &found {
        println!("  {}", path.display());
        println!(
            "    {} -> {} (chunk {}, parallelism {})",
            state.source_service, state.target_service, state.chunk_size, state.parallelism
        );
        for table in &state.tables {
            println!(
                "    {}: last key {} (resume: psc copy {} {} {} --primary-key {} --last-id {})",
                table.table_name,
                table.last_id,
                state.source_service,
                state.target_service,
                table.table_name,
                table.primary_key,
                table.last_id
            );
        }
    }
    println!();
    Ok(())
}

/// Spawn a task printing progress events to stderr with a derived rate/ETA.
fn spawn_progress_printer() -> mpsc::Sender<ProgressEvent> {
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);
    tokio::spawn(async move {
        let started = Instant::now();
        let mut baseline: Option<i64> = None;
        while let Some(event) = rx.recv().await {
            let done = baseline.get_or_insert(event.total_affected - event.rows_affected);
            let elapsed = started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                ((event.total_affected - *done) as f64 / elapsed) as i64
            } else {
                0
            };

            let total = event.estimated_total.or(event.max_key);
            let eta = total.and_then(|t| {
                let remaining = t - event.end_key;
                (rate > 0 && remaining > 0).then(|| remaining / rate.max(1))
            });

            let mut line = format!(
                "{}: key {} ({} rows, {} rows/s",
                event.table,
                event.end_key,
                format_number(event.total_affected),
                format_number(rate)
            );
            if let Some(eta) = eta {
                line.push_str(&format!(", ETA {}s", eta));
            }
            line.push(')');
            eprintln!("{}", line);
        }
    });
    tx
}

fn setup_logging(verbosity: &str, format: &str) -> Result<()> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers: SIGINT and SIGTERM fire the operation's
/// cancellation token; workers drain and progress stays durable for resume.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT. Finishing in-flight chunks..."),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM. Finishing in-flight chunks..."),
        }
        token.cancel();
    });

    Ok(cancel)
}

#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C. Finishing in-flight chunks...");
        token.cancel();
    });

    Ok(cancel)
}

/// Add thousands separators for display.
fn format_number(n: i64) -> String {
    if n < 0 {
        return format!("-{}", format_number(-n));
    }
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(-45000), "-45,000");
    }
}
