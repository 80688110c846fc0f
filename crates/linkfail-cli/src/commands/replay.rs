//! `linkfail replay`: rerun an experiment along a recorded schedule.

use std::path::Path;

use anyhow::{Context, Result};
use linkfail_sim::{EventLog, ExperimentRunner};

use super::experiment::{CommandError, ExperimentArgs};
use crate::style::{self, colors::SemanticStyle};

pub fn run(schedule: &Path, args: &ExperimentArgs, json: bool) -> Result<()> {
    let log = EventLog::load_from_file(schedule)
        .with_context(|| format!("reading schedule {}", schedule.display()))?;
    let config = args.load()?;

    if !json {
        let summary = log.summary();
        println!(
            "Replaying {} ({} delivered, {} dropped, recorded with seed {})",
            schedule.display().to_string().code(),
            summary.delivered,
            summary.dropped,
            log.seed()
        );
        if log.seed() != config.run.seed {
            style::print_hint("Seeds differ; only link decisions are taken from the schedule");
        }
    }

    let report = ExperimentRunner::new(config)
        .replay(&log)
        .context("replay failed")?;

    if json {
        style::print_json(&report)?;
    } else {
        println!("{}", style::report_table(&report));
        style::print_labeled("commit fingerprint", &report.commit_fingerprint);
    }
    CommandError::check(&report)?;
    Ok(())
}
