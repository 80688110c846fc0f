//! High-level runner: single runs, seed batches, replays and sweeps.

use std::time::Instant;

use chrono::Utc;
use linkfail_config::{ExperimentConfig, Granularity};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SimError;
use crate::event_log::EventLog;
use crate::metrics::RunReport;
use crate::replay::ScheduleReplayer;
use crate::result_log::{ResultLog, result_file_name};
use crate::shutdown::ShutdownSignal;
use crate::simulation::Simulation;

// ============================================================================
// Batch Results
// ============================================================================

/// Results of running consecutive seeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResults {
    pub reports: Vec<RunReport>,
    /// Seeds that did not converge, violated safety or errored.
    pub failed_seeds: Vec<u64>,
    /// Seeds whose run could not complete, with the error.
    pub errors: Vec<(u64, String)>,
    /// Seeds whose second run differed from the first.
    pub nondeterministic: Vec<(u64, Vec<String>)>,
    pub elapsed_secs: f64,
}

impl BatchResults {
    pub fn all_passed(&self) -> bool {
        self.failed_seeds.is_empty() && self.nondeterministic.is_empty()
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.reports.len() + self.errors.len();
        if total == 0 {
            0.0
        } else {
            (total - self.failed_seeds.len()) as f64 / total as f64
        }
    }

    /// Runs per wall-clock second.
    pub fn rate(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            (self.reports.len() + self.errors.len()) as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}

// ============================================================================
// Experiment Runner
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExperimentRunner {
    config: ExperimentConfig,
    shutdown: Option<ShutdownSignal>,
}

impl ExperimentRunner {
    pub fn new(config: ExperimentConfig) -> Self {
        Self {
            config,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    fn config_for(&self, seed: u64) -> ExperimentConfig {
        let mut config = self.config.clone();
        config.run.seed = seed;
        config
    }

    /// Attaches the result log and shutdown signal the config asks for.
    fn prepare(&self, simulation: Simulation, config: &ExperimentConfig) -> Result<Simulation, SimError> {
        let mut simulation = simulation;
        if let Some(dir) = &config.run.output_dir {
            let timestamp = config.run.timestamped.then(Utc::now);
            let name = result_file_name(
                config.cluster.nodes,
                config.workload.requests,
                config.network.drop_probability,
                config.run.seed,
                timestamp,
            );
            let log = ResultLog::create(dir, &name)?;
            info!(path = %dir.join(&name).display(), "writing result log");
            simulation = simulation.with_result_log(log);
        }
        if let Some(signal) = &self.shutdown {
            simulation = simulation.with_shutdown(signal.clone());
        }
        Ok(simulation)
    }

    /// Runs the configured experiment under `seed`.
    pub fn run_single(&self, seed: u64) -> Result<RunReport, SimError> {
        let config = self.config_for(seed);
        let mut simulation = self.prepare(Simulation::new(&config)?, &config)?;
        simulation.run()
    }

    /// Runs under `seed` and returns the recorded event log too.
    pub fn run_recorded(&self, seed: u64) -> Result<(RunReport, EventLog), SimError> {
        let config = self.config_for(seed);
        let mut simulation = self.prepare(Simulation::new(&config)?.with_event_log(), &config)?;
        let report = simulation.run()?;
        Ok((report, simulation.into_event_log()))
    }

    /// Reruns the configuration with link decisions taken from `log`.
    pub fn replay(&self, log: &EventLog) -> Result<RunReport, SimError> {
        let replayer = ScheduleReplayer::from_event_log(log);
        let mut simulation = Simulation::with_oracle(&self.config, Box::new(replayer))?;
        if let Some(signal) = &self.shutdown {
            simulation = simulation.with_shutdown(signal.clone());
        }
        simulation.run()
    }

    /// Runs `iterations` consecutive seeds starting at the configured one.
    /// With `check_determinism`, every seed runs twice and the reports are
    /// compared.
    pub fn run_batch(&self, iterations: u64, check_determinism: bool) -> BatchResults {
        let start = Instant::now();
        let mut reports = Vec::new();
        let mut failed_seeds = Vec::new();
        let mut errors = Vec::new();
        let mut nondeterministic = Vec::new();

        for i in 0..iterations {
            if self.shutdown.as_ref().is_some_and(ShutdownSignal::is_triggered) {
                break;
            }
            let seed = self.config.run.seed.wrapping_add(i);
            let report = match self.run_single(seed) {
                Ok(report) => report,
                Err(error) => {
                    warn!(seed, error = %error, "run failed");
                    failed_seeds.push(seed);
                    errors.push((seed, error.to_string()));
                    continue;
                }
            };

            if check_determinism {
                match self.run_single(seed) {
                    Ok(again) => {
                        if let Err(differences) = report.check_determinism(&again) {
                            warn!(seed, ?differences, "nondeterministic run");
                            nondeterministic.push((seed, differences));
                        }
                    }
                    Err(error) => nondeterministic.push((seed, vec![error.to_string()])),
                }
            }

            if !report.outcome.is_converged() {
                failed_seeds.push(seed);
            }
            reports.push(report);
        }

        BatchResults {
            reports,
            failed_seeds,
            errors,
            nondeterministic,
            elapsed_secs: start.elapsed().as_secs_f64(),
        }
    }
}

// ============================================================================
// Sweep
// ============================================================================

/// Grid of cluster sizes by uniform drop probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    pub nodes: Vec<usize>,
    pub probabilities: Vec<f64>,
}

/// One cell of a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRow {
    pub nodes: usize,
    pub probability: f64,
    pub report: Option<RunReport>,
    pub error: Option<String>,
}

impl Sweep {
    pub fn new(nodes: Vec<usize>, probabilities: Vec<f64>) -> Self {
        Self { nodes, probabilities }
    }

    pub fn len(&self) -> usize {
        self.nodes.len() * self.probabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every combination on top of `base`, which keeps everything but
    /// the cluster size, fault count and link policy.
    pub fn run(&self, base: &ExperimentConfig, shutdown: Option<&ShutdownSignal>) -> Vec<SweepRow> {
        let mut rows = Vec::with_capacity(self.len());
        for &nodes in &self.nodes {
            for &probability in &self.probabilities {
                if shutdown.is_some_and(ShutdownSignal::is_triggered) {
                    return rows;
                }
                let mut config = base.clone();
                config.cluster.nodes = nodes;
                config.cluster.faults = None;
                config.network.granularity = Granularity::Uniform;
                config.network.drop_probability = probability;

                let mut runner = ExperimentRunner::new(config);
                if let Some(signal) = shutdown {
                    runner = runner.with_shutdown(signal.clone());
                }
                let seed = base.run.seed;
                let row = match runner.run_single(seed) {
                    Ok(report) => SweepRow {
                        nodes,
                        probability,
                        report: Some(report),
                        error: None,
                    },
                    Err(error) => SweepRow {
                        nodes,
                        probability,
                        report: None,
                        error: Some(error.to_string()),
                    },
                };
                rows.push(row);
            }
        }
        rows
    }
}
