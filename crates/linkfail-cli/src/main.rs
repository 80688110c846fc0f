//! linkfail command line.
//!
//! PBFT under Bernoulli link failures: simulate, sweep, replay and drive a
//! live cluster.
//!
//! # Quick Start
//!
//! ```bash
//! # The reference experiment: N = 4, p = 0.1, 100 requests
//! linkfail run --nodes 4 --probability 0.1 --requests 100 --seed 42
//!
//! # Record the link schedule, then replay it
//! linkfail run --seed 42 --record schedule.bin
//! linkfail replay schedule.bin
//!
//! # Grid of sizes and probabilities
//! linkfail sweep --node-counts 4,7,10 --probabilities 0,0.05,0.1,0.2
//! ```

mod commands;
mod style;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::experiment::ExperimentArgs;
use commands::harness::HarnessArgs;

/// linkfail - PBFT consensus under Bernoulli link failures.
#[derive(Parser)]
#[command(name = "linkfail")]
#[command(author, version, long_about = None)]
#[command(about = "linkfail - PBFT consensus under Bernoulli link failures")]
#[command(propagate_version = true)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment.
    Run {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,

        /// Save the link schedule for replay.
        #[arg(long, value_name = "FILE")]
        record: Option<PathBuf>,
    },

    /// Run consecutive seeds.
    Batch {
        #[command(flatten)]
        experiment: ExperimentArgs,

        #[arg(short, long, default_value_t = 10)]
        iterations: u64,

        /// Run every seed twice and compare the reports.
        #[arg(long)]
        check_determinism: bool,

        #[arg(long)]
        json: bool,
    },

    /// Run every combination of cluster size and drop probability.
    Sweep {
        #[command(flatten)]
        experiment: ExperimentArgs,

        #[arg(long, value_delimiter = ',', default_value = "4,7,10")]
        node_counts: Vec<usize>,

        #[arg(long, value_delimiter = ',', default_value = "0,0.05,0.1,0.2")]
        probabilities: Vec<f64>,

        #[arg(long)]
        json: bool,
    },

    /// Replay a recorded link schedule.
    Replay {
        /// Schedule written by `run --record`.
        schedule: PathBuf,

        #[command(flatten)]
        experiment: ExperimentArgs,

        #[arg(long)]
        json: bool,
    },

    /// Coordinate an externally launched cluster.
    Harness {
        #[command(flatten)]
        args: HarnessArgs,

        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    style::set_no_color(cli.no_color || std::env::var_os("NO_COLOR").is_some());

    match cli.command {
        Commands::Run {
            experiment,
            json,
            record,
        } => commands::run::run(&experiment, json, record.as_deref()),
        Commands::Batch {
            experiment,
            iterations,
            check_determinism,
            json,
        } => commands::batch::run(&experiment, iterations, check_determinism, json),
        Commands::Sweep {
            experiment,
            node_counts,
            probabilities,
            json,
        } => commands::sweep::run(&experiment, node_counts, probabilities, json),
        Commands::Replay {
            schedule,
            experiment,
            json,
        } => commands::replay::run(&schedule, &experiment, json),
        Commands::Harness { args, json } => commands::harness::run(&args, json),
    }
}
