//! `linkfail run`: one experiment, one seed.

use std::path::Path;

use anyhow::{Context, Result};
use linkfail_sim::ExperimentRunner;

use super::experiment::{CommandError, ExperimentArgs};
use crate::style::{self, colors::SemanticStyle};

pub fn run(args: &ExperimentArgs, json: bool, record: Option<&Path>) -> Result<()> {
    let config = args.load()?;
    let seed = config.run.seed;
    if !json {
        println!(
            "Running {} ({})",
            config.run_identity().header(),
            format!("{:?} links", config.network.granularity).muted()
        );
    }

    let runner = ExperimentRunner::new(config);
    let report = match record {
        Some(path) => {
            let (report, log) = runner.run_recorded(seed).context("simulation failed")?;
            log.save_to_file(path)
                .with_context(|| format!("writing schedule to {}", path.display()))?;
            if !json {
                style::print_success(&format!(
                    "Recorded {} decisions to {}",
                    log.len(),
                    path.display().to_string().code()
                ));
            }
            report
        }
        None => runner.run_single(seed).context("simulation failed")?,
    };

    if json {
        style::print_json(&report)?;
    } else {
        println!("{}", style::report_table(&report));
        for violation in &report.invariant_violations {
            style::print_warn(&format!("{}: {}", violation.invariant, violation.message));
        }
    }

    CommandError::check(&report)?;
    if !json {
        style::print_success(&format!(
            "{} requests committed",
            report.requests_completed.to_string().success()
        ));
    }
    Ok(())
}
