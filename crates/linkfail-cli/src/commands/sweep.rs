//! `linkfail sweep`: cluster sizes by drop probabilities.

use anyhow::Result;
use linkfail_sim::Sweep;

use super::experiment::ExperimentArgs;
use crate::style::{self, colors::SemanticStyle};

pub fn run(args: &ExperimentArgs, node_counts: Vec<usize>, probabilities: Vec<f64>, json: bool) -> Result<()> {
    let base = args.load()?;
    let sweep = Sweep::new(node_counts, probabilities);
    if sweep.is_empty() {
        anyhow::bail!("sweep needs at least one node count and one probability");
    }
    if !json {
        println!(
            "Sweeping {} configurations (seed {}, {} requests)",
            sweep.len().to_string().header(),
            base.run.seed.to_string().code(),
            base.workload.requests
        );
    }

    let rows = sweep.run(&base, None);

    if json {
        style::print_json(&rows)?;
    } else {
        println!("{}", style::sweep_table(&rows));
    }

    let unsafe_cells = rows
        .iter()
        .filter(|row| row.report.as_ref().is_some_and(|r| r.has_safety_violation()))
        .count();
    if unsafe_cells > 0 {
        anyhow::bail!("{unsafe_cells} configuration(s) violated safety");
    }
    let errors = rows.iter().filter(|row| row.error.is_some()).count();
    if errors > 0 {
        anyhow::bail!("{errors} configuration(s) failed to run");
    }
    Ok(())
}
