//! `linkfail batch`: consecutive seeds with an optional determinism check.

use anyhow::Result;
use linkfail_sim::ExperimentRunner;

use super::experiment::ExperimentArgs;
use crate::style::{self, colors::SemanticStyle};

pub fn run(args: &ExperimentArgs, iterations: u64, check_determinism: bool, json: bool) -> Result<()> {
    let config = args.load()?;
    let first_seed = config.run.seed;
    if !json {
        println!(
            "Running {} seeds from {} ({})",
            iterations.to_string().header(),
            first_seed.to_string().code(),
            config.run_identity().muted()
        );
    }

    let results = ExperimentRunner::new(config).run_batch(iterations, check_determinism);

    if json {
        style::print_json(&results)?;
    } else {
        println!("{}", style::batch_table(&results));
        println!(
            "  Time: {:.2}s ({:.0} runs/sec), success rate {:.1}%",
            results.elapsed_secs,
            results.rate(),
            results.success_rate() * 100.0
        );
        for (seed, error) in &results.errors {
            style::print_error(&format!("seed {seed}: {error}"));
        }
        for (seed, differences) in &results.nondeterministic {
            style::print_error(&format!("seed {seed} is nondeterministic: {}", differences.join("; ")));
        }
        if !results.failed_seeds.is_empty() {
            println!();
            println!("{}", "Failed seeds (reproduce with):".warning());
            for seed in &results.failed_seeds {
                println!("  {} run --seed {}", "linkfail".code(), seed);
            }
        }
    }

    if results.all_passed() {
        if !json {
            style::print_success(&format!("All {} runs converged", results.reports.len()));
        }
        Ok(())
    } else {
        anyhow::bail!(
            "{} failed and {} nondeterministic seed(s)",
            results.failed_seeds.len(),
            results.nondeterministic.len()
        )
    }
}
