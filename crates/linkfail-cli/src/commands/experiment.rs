//! Experiment flags shared by the simulation commands.

use std::path::PathBuf;

use clap::Args;
use linkfail_config::{ByzantineAssignment, ConfigError, ConfigLoader, ExperimentConfig};
use linkfail_sim::RunReport;
use thiserror::Error;
use tracing::debug;

/// Errors from turning flags into a runnable experiment, or from a run
/// whose outcome should fail the command.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("seed {seed}: {count} safety violation(s)")]
    SafetyViolation { seed: u64, count: usize },

    #[error("seed {seed} did not converge: {reason}")]
    NotConverged { seed: u64, reason: String },
}

impl CommandError {
    /// Maps a failed outcome to an error; converged runs pass.
    pub fn check(report: &RunReport) -> Result<(), Self> {
        match &report.outcome {
            linkfail_sim::Outcome::Converged => Ok(()),
            linkfail_sim::Outcome::SafetyViolation { count } => Err(CommandError::SafetyViolation {
                seed: report.seed,
                count: *count,
            }),
            linkfail_sim::Outcome::NonConverged { reason } => Err(CommandError::NotConverged {
                seed: report.seed,
                reason: reason.clone(),
            }),
            linkfail_sim::Outcome::Cancelled => Err(CommandError::NotConverged {
                seed: report.seed,
                reason: "cancelled".to_string(),
            }),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ExperimentArgs {
    /// Experiment file (TOML, or INI with numNodes/failureProbability/...).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of replicas N.
    #[arg(short, long)]
    pub nodes: Option<usize>,

    /// Tolerated faults f (N must equal 3f + 1).
    #[arg(short, long)]
    pub faults: Option<usize>,

    /// Drop probability on every replica link.
    #[arg(short, long)]
    pub probability: Option<f64>,

    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Requests to complete.
    #[arg(short, long)]
    pub requests: Option<u64>,

    /// Simulated time limit in milliseconds.
    #[arg(long)]
    pub horizon_ms: Option<u64>,

    /// Directory for result logs.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Misbehaving replica, as id=behaviour (honest, equivocate, silent,
    /// delay:<ms>). Repeatable.
    #[arg(short, long, value_name = "ID=BEHAVIOUR")]
    pub byzantine: Vec<String>,

    /// Stop at the first invariant violation.
    #[arg(long)]
    pub strict: bool,
}

impl ExperimentArgs {
    /// Merges defaults, the config file, `LINKFAIL_*` variables and the
    /// flags, then validates the result.
    pub fn load(&self) -> Result<ExperimentConfig, CommandError> {
        let mut loader = ConfigLoader::new();
        if let Some(path) = &self.config {
            loader = loader.with_file(path);
        }
        if let Some(nodes) = self.nodes {
            loader = loader.with_override("cluster.nodes", nodes);
        }
        if let Some(faults) = self.faults {
            loader = loader.with_override("cluster.faults", faults);
        }
        if let Some(p) = self.probability {
            loader = loader.with_override("network.drop_probability", p);
        }
        if let Some(seed) = self.seed {
            loader = loader.with_override("run.seed", seed);
        }
        if let Some(requests) = self.requests {
            loader = loader.with_override("workload.requests", requests);
        }
        if let Some(horizon) = self.horizon_ms {
            loader = loader.with_override("run.horizon_ms", horizon);
        }
        if let Some(dir) = &self.output {
            loader = loader.with_override("run.output_dir", dir.display());
        }
        if self.strict {
            loader = loader.with_override("run.strict", true);
        }

        let mut config = loader.load()?;
        if !self.byzantine.is_empty() {
            config.cluster.byzantine = self
                .byzantine
                .iter()
                .map(|entry| entry.parse::<ByzantineAssignment>())
                .collect::<Result<_, _>>()?;
            config.validate()?;
        }
        debug!(experiment = %config.run_identity(), "experiment loaded");
        Ok(config)
    }
}
