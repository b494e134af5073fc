//! snoopy - local activity capture daemon
//!
//! `snoopy run` starts every enabled collector and writes what they observe
//! into a single SQLite event log until interrupted. `snoopy status` shows
//! collector progress and stored event counts.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/snoopy/snoopy.db (or $SNOOPY_DATA_DIR/snoopy.db)
//! - Logs: $XDG_STATE_HOME/snoopy/snoopy.<date>.log
//! - Config: $XDG_CONFIG_HOME/snoopy/config.toml

mod process_lock;
mod registry;
mod sources;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use process_lock::acquire_daemon_lock;
use snoopy_core::watermark::CollectorState;
use snoopy_core::{logging, Config, Database, RunReport, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "snoopy")]
#[command(about = "Capture local activity into a SQLite event log")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/snoopy/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the capture daemon in the foreground until Ctrl+C or SIGTERM
    Run,

    /// Show collector progress and stored event counts
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    match args.verbose {
        0 => {}
        1 => config.logging.level = "debug".to_string(),
        _ => config.logging.level = "trace".to_string(),
    }

    match args.command {
        Command::Run => run(config),
        Command::Status { json } => status(config, json),
    }
}

fn run(mut config: Config) -> Result<()> {
    config.logging.stderr = true;
    let _log_guard = logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "snoopy starting");

    // One daemon per database.
    let db_path = Config::database_path();
    let _daemon_lock = acquire_daemon_lock(&db_path).context("failed to acquire process lock")?;

    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let collectors = registry::build(&config, &Config::home_dir())?;
    if collectors.is_empty() {
        anyhow::bail!("every collector is disabled; nothing to run");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("snoopy")
        .build()
        .context("failed to start async runtime")?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        interrupt.cancel();
    })
    .context("failed to set Ctrl+C handler")?;

    let report = runtime
        .block_on(async move {
            let handle = Scheduler::new(config, Arc::new(db), collectors).start(cancel.clone())?;
            println!("snoopy running (run {}). Press Ctrl+C to stop.", handle.run_id());

            cancel.cancelled().await;
            handle.shutdown().await
        })
        .context("scheduler failed")?;

    print_run_summary(&report);
    if let Some(error) = report.fatal {
        anyhow::bail!("event store became unreachable: {}", error);
    }
    Ok(())
}

fn print_run_summary(report: &RunReport) {
    let stats = &report.stats;
    println!();
    println!("Run {} stopped", report.run_id);
    println!("  Events written:      {}", stats.events_written);
    println!("  Duplicates ignored:  {}", stats.duplicates_ignored);
    println!("  Excluded:            {}", stats.records_excluded);
    println!("  Deduplicated:        {}", stats.records_deduplicated);
    println!("  Collect failures:    {}", stats.collect_failures);
    if stats.events_lost > 0 || stats.overflow_dropped > 0 || stats.push_dropped > 0 {
        println!(
            "  Lost:                {} (write failures), {} (overflow), {} (push channel full)",
            stats.events_lost, stats.overflow_dropped, stats.push_dropped
        );
    }
}

fn status(config: Config, json: bool) -> Result<()> {
    let _log_guard = logging::init(&config.logging).context("failed to initialize logging")?;

    let db_path = Config::database_path();
    if !db_path.exists() {
        if json {
            let output = serde_json::json!({
                "database": db_path.display().to_string(),
                "collectors": [],
                "tables": {},
                "last_health": null,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!("No database at {}", db_path.display());
            println!("Run 'snoopy run' to start capturing.");
        }
        return Ok(());
    }

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let states = db
        .list_collector_states()
        .context("failed to read collector state")?;
    let counts = db.table_counts().context("failed to count events")?;
    let last_health = db
        .recent_health(1)
        .context("failed to read daemon health")?
        .into_iter()
        .next();

    if json {
        let tables: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(table, count)| (table.to_string(), serde_json::json!(count)))
            .collect();
        let output = serde_json::json!({
            "database": db_path.display().to_string(),
            "collectors": states.iter().map(|s| {
                serde_json::json!({
                    "name": s.name,
                    "watermark": s.watermark,
                    "last_run_at": s.last_run_at,
                    "consecutive_failures": s.consecutive_failures,
                })
            }).collect::<Vec<_>>(),
            "tables": tables,
            "last_health": last_health.as_ref().map(|h| {
                serde_json::json!({
                    "timestamp": h.timestamp,
                    "event_type": h.event_type,
                    "details": h.details,
                })
            }),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Database: {}", db_path.display());
    println!(
        "Log:      {}",
        logging::log_file_for(chrono::Local::now().date_naive()).display()
    );
    if let Some(health) = &last_health {
        println!(
            "Last daemon event: {} at {}",
            health.event_type,
            format_epoch(health.timestamp)
        );
    }

    println!();
    println!("Collectors:");
    if states.is_empty() {
        println!("  (none have run yet)");
    }
    for state in &states {
        print_collector(state);
    }

    println!();
    println!("Events:");
    let mut total = 0;
    for (table, count) in counts.iter().filter(|(_, count)| *count > 0) {
        println!("  {:<22} {:>8}", table, count);
        total += count;
    }
    println!("  {:<22} {:>8}", "total", total);
    Ok(())
}

fn print_collector(state: &CollectorState) {
    let last_run = state
        .last_run_at
        .map(format_epoch)
        .unwrap_or_else(|| "never".to_string());
    println!(
        "  {:<12} last run {}  failures {}  watermark {}",
        state.name,
        last_run,
        state.consecutive_failures,
        state.watermark.as_deref().unwrap_or("-")
    );
}

/// Local time for an epoch-seconds timestamp.
fn format_epoch(ts: f64) -> String {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9) as u32;
    match chrono::DateTime::from_timestamp(secs as i64, nanos) {
        Some(utc) => utc
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => format!("{ts}"),
    }
}
