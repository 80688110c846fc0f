//! Report tables using comfy-table.

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};
use linkfail_live::RoundReport;
use linkfail_sim::{BatchResults, RunReport, SweepRow};

use super::colors::{self, SemanticStyle};

fn base_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// A table with a bold cyan header row.
fn grid(columns: &[&str]) -> Table {
    let mut table = base_table();
    let header: Vec<Cell> = columns
        .iter()
        .map(|col| {
            if super::no_color() {
                Cell::new(col)
            } else {
                Cell::new(col).add_attribute(Attribute::Bold).fg(Color::Cyan)
            }
        })
        .collect();
    table.set_header(header);
    table
}

fn number(value: impl ToString) -> Cell {
    Cell::new(value.to_string()).set_alignment(CellAlignment::Right)
}

/// Two-column key/value table.
pub fn info_table(entries: &[(&str, String)]) -> Table {
    let mut table = base_table();
    for (key, value) in entries {
        let key_cell = if super::no_color() {
            Cell::new(key)
        } else {
            Cell::new(key).fg(Color::DarkGrey)
        };
        table.add_row(vec![key_cell, Cell::new(value)]);
    }
    table
}

/// Everything a single run reports.
pub fn report_table(report: &RunReport) -> Table {
    let latency = &report.latency;
    let mut entries = vec![
        ("outcome", colors::outcome(&report.outcome)),
        ("seed", report.seed.to_string()),
        ("cluster", format!("n={} f={}", report.nodes, report.faults)),
        ("drop probability", format!("{:.3}", report.drop_probability)),
        ("link oracle", report.link_oracle.clone()),
        (
            "requests",
            format!(
                "{}/{} completed ({} retries)",
                report.requests_completed, report.requests_issued, report.client_retries
            ),
        ),
        (
            "latency ms",
            format!(
                "p50 {:.2}  p95 {:.2}  p99 {:.2}  max {:.2}",
                latency.p50_ms, latency.p95_ms, latency.p99_ms, latency.max_ms
            ),
        ),
        ("throughput", format!("{:.1} req/s", report.throughput_rps)),
        (
            "view changes",
            format!(
                "{} installed, {} started, max view {}",
                report.view_changes, report.view_change_attempts, report.max_view
            ),
        ),
        ("state transfers", report.state_transfers.to_string()),
        (
            "links",
            format!(
                "{} attempted, {} dropped ({:.1}%)",
                report.links.attempted,
                report.links.dropped,
                report.links.drop_rate() * 100.0
            ),
        ),
        ("protocol violations", report.protocol_violation_total().to_string()),
        ("invariant violations", report.invariant_violations.len().to_string()),
        (
            "simulated time",
            format!("{:.1} ms", report.final_time_ns as f64 / 1_000_000.0),
        ),
        ("events", report.events_processed.to_string()),
    ];
    if let linkfail_sim::Outcome::NonConverged { reason } = &report.outcome {
        entries.insert(1, ("reason", reason.warning()));
    }
    info_table(&entries)
}

/// One row per seed of a batch.
pub fn batch_table(results: &BatchResults) -> Table {
    let mut table = grid(&["seed", "outcome", "completed", "view changes", "dropped", "p99 ms"]);
    for report in &results.reports {
        table.add_row(vec![
            number(report.seed),
            Cell::new(colors::outcome(&report.outcome)),
            number(format!("{}/{}", report.requests_completed, report.requests_issued)),
            number(report.view_changes),
            number(report.links.dropped),
            number(format!("{:.2}", report.latency.p99_ms)),
        ]);
    }
    table
}

/// One row per (nodes, probability) cell of a sweep.
pub fn sweep_table(rows: &[SweepRow]) -> Table {
    let mut table = grid(&["n", "p", "outcome", "completed", "view changes", "mean ms", "p99 ms"]);
    for row in rows {
        let mut cells = vec![number(row.nodes), number(format!("{:.3}", row.probability))];
        match (&row.report, &row.error) {
            (Some(report), _) => cells.extend([
                Cell::new(colors::outcome(&report.outcome)),
                number(format!("{}/{}", report.requests_completed, report.requests_issued)),
                number(report.view_changes),
                number(format!("{:.2}", report.latency.mean_ms)),
                number(format!("{:.2}", report.latency.p99_ms)),
            ]),
            (None, error) => {
                let message = error.as_deref().unwrap_or("not run");
                cells.push(Cell::new(message.error()));
            }
        }
        table.add_row(cells);
    }
    table
}

/// One row per live harness round.
pub fn round_table(rounds: &[RoundReport]) -> Table {
    let mut table = grid(&["round", "nodes", "replies", "timed out", "mean ms", "elapsed ms"]);
    for round in rounds {
        let replies = format!("{}/{}", round.replies, round.requests_planned);
        let replies = if round.is_complete() {
            replies.success()
        } else {
            replies.warning()
        };
        table.add_row(vec![
            number(round.round),
            number(round.nodes_ready),
            Cell::new(replies).set_alignment(CellAlignment::Right),
            number(round.timed_out),
            number(format!("{:.2}", round.mean_latency_ms)),
            number(round.elapsed_ms),
        ]);
    }
    table
}
