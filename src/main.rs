//! # Storage Rollup CLI (`rollup`)
//!
//! The `rollup` binary drives the storage-usage pipeline against a SQLite
//! inventory and keeps its checkpoints and published results in a second
//! SQLite database.
//!
//! ## Usage
//!
//! ```bash
//! rollup --config ./config/rollup.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rollup init` | Create the checkpoint schema (and inventory schema with `--facts`) |
//! | `rollup step` | Run one bounded invocation of the pipeline |
//! | `rollup run` | Invoke the pipeline until the cycle publishes |
//! | `rollup status` | Show progress, totals and per-entity usage |
//! | `rollup export <section>` | Print published results as JSON |
//! | `rollup purge [region...]` | Delete checkpoint state |
//!
//! ## Examples
//!
//! ```bash
//! # Refresh results from cron only when they are older than the window
//! rollup run --if-stale --config ./config/rollup.toml
//!
//! # Work a little at a time
//! rollup run --max-steps 10
//!
//! # Usage for one category subtree
//! rollup status --category 3
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use storage_rollup::export::ExportSection;
use storage_rollup::progress::ProgressMode;
use storage_rollup::{config, export, migrate, runner, status};

/// Storage Rollup CLI: incremental storage-usage rollups over a
/// deduplicated file inventory.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "rollup",
    about = "Storage Rollup: incremental storage-usage rollups over a deduplicated file inventory",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rollup.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Step progress on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the checkpoint database.
    ///
    /// Idempotent. With `--facts`, also creates an empty inventory schema
    /// at `[facts].path`.
    Init {
        /// Also create the inventory tables.
        #[arg(long)]
        facts: bool,
    },

    /// Run exactly one pipeline invocation.
    Step,

    /// Invoke the pipeline until the current cycle publishes.
    Run {
        /// Do nothing while published results are younger than `staleness_hours`.
        #[arg(long)]
        if_stale: bool,

        /// Stop after this many invocations even if the cycle is unfinished.
        #[arg(long)]
        max_steps: Option<usize>,
    },

    /// Show progress of the running cycle and the published results.
    Status {
        /// Restrict course and category tables to this category and its descendants.
        #[arg(long)]
        category: Option<i64>,
    },

    /// Export published results as JSON.
    Export {
        /// Section to export.
        #[arg(value_enum)]
        section: ExportSection,

        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Delete checkpoint state.
    ///
    /// Regions: `progress`, `mapping`, `aggregates`, `results`. All regions
    /// when none are given.
    Purge {
        regions: Vec<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let reporter = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Init { facts } => {
            migrate::run_migrations(&cfg, facts).await?;
            println!("Database initialized successfully.");
        }
        Commands::Step => {
            runner::run_step(&cfg, reporter.as_ref()).await?;
        }
        Commands::Run {
            if_stale,
            max_steps,
        } => {
            runner::run_cycle(&cfg, if_stale, max_steps, reporter.as_ref()).await?;
        }
        Commands::Status { category } => {
            status::run_status(&cfg, category).await?;
        }
        Commands::Export { section, output } => {
            export::run_export(&cfg, section, output.as_deref()).await?;
        }
        Commands::Purge { regions } => {
            runner::run_purge(&cfg, &regions).await?;
        }
    }

    Ok(())
}
