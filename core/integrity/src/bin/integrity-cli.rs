//! Integrity CLI - Cycle maintenance from the command line
//!
//! Usage:
//!   integrity-cli [--db-path <path>] [--today <YYYY-MM-DD>] <command>
//!
//! Commands:
//!   ensure    Generate monthly cycles around today
//!   current   Print the current cycle (rolling stale tasks forward if enabled)
//!   rollover  Move unfinished tasks out of past cycles
//!   generate  Create back-to-back cycles of a fixed length

use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use farmstead_integrity::{CycleScheduler, Database, IntegrityConfig, RolloverEngine};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "integrity-cli")]
#[command(about = "Maintain Farmstead cycles and roll over unfinished work")]
struct Args {
    /// Path to SQLite database file (defaults to DB_PATH)
    #[arg(long, short, global = true)]
    db_path: Option<PathBuf>,

    /// Treat this date as today
    #[arg(long, global = true)]
    today: Option<NaiveDate>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate monthly cycles around today
    Ensure {
        #[arg(long)]
        months_ahead: Option<u32>,
        #[arg(long)]
        months_behind: Option<u32>,
    },
    /// Print the cycle containing today
    Current {
        /// Skip the rollover even if ROLLOVER_ON_CURRENT is set
        #[arg(long)]
        no_rollover: bool,
    },
    /// Move unfinished tasks from past cycles into the current one
    Rollover,
    /// Create consecutive cycles, e.g. weekly sprints
    Generate {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        count: u32,
        #[arg(long, default_value_t = 7)]
        duration_days: u32,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = IntegrityConfig::from_env();

    let db_path = args.db_path.unwrap_or_else(|| config.db_path.clone());
    let today = args.today.unwrap_or_else(|| Local::now().date_naive());
    info!("Database: {}", db_path.display());

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(&db_path)?;
    let scheduler = CycleScheduler::new();
    let engine = RolloverEngine::new();

    match args.command {
        Command::Ensure {
            months_ahead,
            months_behind,
        } => {
            let cycles = scheduler.ensure_cycles_exist(
                &db,
                months_ahead.unwrap_or(config.months_ahead),
                months_behind.unwrap_or(config.months_behind),
                today,
            )?;
            for cycle in &cycles {
                println!("{:>5}  {}  {}  {}", cycle.id, cycle.start_date, cycle.end_date, cycle.name);
            }
            info!("{} cycles on record", cycles.len());
        }
        Command::Current { no_rollover } => {
            let cycle = if config.rollover_on_current && !no_rollover {
                let (cycle, report) = engine.current_cycle_with_rollover(&db, today)?;
                if report.rolled_over > 0 {
                    info!("Rolled over {} tasks", report.rolled_over);
                }
                cycle
            } else {
                scheduler.current_cycle(&db, today)?
            };
            println!("{}", serde_json::to_string_pretty(&cycle)?);
        }
        Command::Rollover => {
            let report = engine.rollover_from_past_cycles(&db, today)?;
            for failure in &report.failed {
                warn!("Task {} ({}) not moved: {}", failure.id, failure.title, failure.error);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Generate {
            start,
            count,
            duration_days,
        } => {
            let cycles = scheduler.generate_cycles(&db, start, count, duration_days)?;
            println!("{}", serde_json::to_string_pretty(&cycles)?);
        }
    }

    Ok(())
}
