//! End-to-end tests of the `linkfail` binary.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn linkfail() -> Command {
    let mut cmd = Command::cargo_bin("linkfail").unwrap();
    cmd.arg("--no-color").env("RUST_LOG", "warn");
    cmd
}

// ============================================================================
// Help and Argument Errors
// ============================================================================

#[test]
fn help_flag_shows_usage() {
    linkfail()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Bernoulli link failures"));
}

#[test]
fn no_command_shows_help() {
    linkfail().assert().failure().stderr(predicate::str::contains("Usage"));
}

#[test]
fn out_of_range_probability_is_rejected() {
    linkfail()
        .args(["run", "--probability", "1.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("drop_probability"));
}

#[test]
fn cluster_size_must_be_three_f_plus_one() {
    linkfail()
        .args(["run", "--nodes", "7", "--faults", "1"])
        .assert()
        .failure();
}

#[test]
fn byzantine_replica_outside_cluster_is_rejected() {
    linkfail()
        .args(["run", "--byzantine", "9=silent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("outside"));
}

// ============================================================================
// Simulation Commands
// ============================================================================

#[test]
fn lossless_run_converges() {
    linkfail()
        .args(["run", "--nodes", "4", "--probability", "0", "--requests", "5", "--seed", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("converged"))
        .stdout(predicate::str::contains("5/5 completed"));
}

#[test]
fn json_report_is_machine_readable() {
    let output = linkfail()
        .args(["run", "--requests", "5", "--seed", "3", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["outcome"]["status"], "converged");
    assert_eq!(report["requests_completed"], 5);
    assert_eq!(report["nodes"], 4);
}

#[test]
fn total_loss_fails_the_command() {
    linkfail()
        .args(["run", "--probability", "1", "--requests", "2", "--horizon-ms", "1000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("did not converge"));
}

#[test]
fn output_flag_writes_result_log() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("results");

    linkfail()
        .args(["run", "--requests", "4", "--seed", "5", "--probability", "0", "--output"])
        .arg(&dir)
        .assert()
        .success();

    let log = fs::read_to_string(dir.join("result_004_004_000_s5.log")).unwrap();
    assert_eq!(log.lines().count(), 5);
    assert!(log.lines().last().unwrap().contains("outcome=converged"));
}

#[test]
fn recorded_schedule_replays() {
    let temp = TempDir::new().unwrap();
    let schedule = temp.path().join("schedule.bin");

    linkfail()
        .args(["run", "--requests", "6", "--probability", "0.1", "--seed", "8", "--record"])
        .arg(&schedule)
        .assert()
        .success()
        .stdout(predicate::str::contains("Recorded"));
    assert!(schedule.exists());

    linkfail()
        .arg("replay")
        .arg(&schedule)
        .args(["--requests", "6", "--probability", "0.1", "--seed", "8"])
        .assert()
        .success()
        .stdout(predicate::str::contains("commit fingerprint"));
}

#[test]
fn batch_reports_every_seed() {
    let output = linkfail()
        .args(["batch", "--iterations", "3", "--requests", "4", "--seed", "10", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let results: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(results["reports"].as_array().unwrap().len(), 3);
    assert!(results["failed_seeds"].as_array().unwrap().is_empty());
}

#[test]
fn sweep_prints_every_cell() {
    let output = linkfail()
        .args([
            "sweep",
            "--node-counts",
            "4,7",
            "--probabilities",
            "0,0.05",
            "--requests",
            "3",
            "--json",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[2]["nodes"], 7);
}

#[test]
fn ini_experiment_file_is_honoured() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("experiment.ini");
    fs::write(&path, "numNodes = 7\nfailureProbability = 0.0\nrequestCount = 3\nseed = 2\n").unwrap();

    let output = linkfail()
        .args(["run", "--json", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["nodes"], 7);
    assert_eq!(report["requests_completed"], 3);
    assert_eq!(report["seed"], 2);
}
