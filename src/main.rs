//! # fscrawl CLI
//!
//! ## Usage
//!
//! ```bash
//! fscrawl --config ./fscrawl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fscrawl run` | Crawl every (or the selected) job, looping on `update_rate` |
//! | `fscrawl status` | Print each job's persisted run state |
//! | `fscrawl restart --job <name>` | Discard a job's run state |

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use fscrawl::{config, logging, runner};

/// Incremental file crawler that keeps a search index converged with a
/// document tree.
#[derive(Parser)]
#[command(name = "fscrawl", version, about)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(long, global = true, default_value = "./fscrawl.toml")]
    config: PathBuf,

    /// Debug-level logging.
    #[arg(long, global = true, conflicts_with = "silent")]
    verbose: bool,

    /// Warnings and errors only.
    #[arg(long, global = true)]
    silent: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the configured jobs.
    ///
    /// Each job runs in its own worker, waiting `update_rate` between
    /// runs, until `--loop` runs are done or the process is interrupted.
    Run {
        /// Job to run (repeatable). Defaults to every configured job.
        #[arg(long = "job")]
        jobs: Vec<String>,

        /// Number of runs per job before exiting.
        #[arg(long = "loop")]
        loops: Option<u64>,

        /// Discard run state first so everything is reindexed.
        #[arg(long)]
        restart: bool,

        /// Use an in-memory backend and state; nothing is written.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the last run, next check and counters of each job.
    Status {
        #[arg(long = "job")]
        jobs: Vec<String>,
    },

    /// Discard a job's run state.
    Restart {
        #[arg(long)]
        job: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.silent)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            jobs,
            loops,
            restart,
            dry_run,
        } => {
            let options = runner::RunOptions {
                jobs,
                loops,
                restart,
                ..Default::default()
            };
            runner::run(&cfg, options, dry_run).await?;
        }
        Commands::Status { jobs } => {
            runner::status(&cfg, &jobs).await?;
        }
        Commands::Restart { job } => {
            runner::restart(&cfg, &job).await?;
        }
    }

    Ok(())
}
