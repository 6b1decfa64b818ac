//! End-to-end tests for the `medic` binary
//!
//! Covers:
//! - Printing default and file-based configuration
//! - A failure-free simulation with a JSON report
//! - Baseline comparison report
//! - Argument validation

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn medic() -> Command {
    let mut cmd = Command::cargo_bin("medic").expect("binary is built");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// The defaults render as TOML sections
#[test]
fn test_config_defaults() {
    medic()
        .args(["config", "--defaults"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[breaker]"))
        .stdout(predicate::str::contains("failure_threshold = 3"))
        .stdout(predicate::str::contains("quarantine_threshold = 10"));
}

/// An explicit file is loaded and validated
#[test]
fn test_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("medic.toml");
    fs::write(&path, "[breaker]\nfailure_threshold = 5\n").unwrap();

    medic()
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("failure_threshold = 5"));

    fs::write(&path, "[runtime]\nqueue_capacity = 0\n").unwrap();
    medic()
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("queue_capacity"));
}

/// With no injected failures every task completes
#[test]
fn test_simulate_without_failures() {
    let output = medic()
        .args([
            "simulate",
            "--tasks",
            "9",
            "--processor-failure-rate",
            "0",
            "--gateway-failure-rate",
            "0",
            "--analytics-failure-rate",
            "0",
            "--json",
            "--log-level",
            "error",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["stats"]["completed"], 9);
    assert_eq!(report["stats"]["escalations"], 0);
    assert_eq!(report["oracle"], "rule-table");
    assert_eq!(report["agents"].as_array().map(Vec::len), Some(3));
}

/// The comparison runs the same workload twice and reports both success rates
#[test]
fn test_compare_without_failures() {
    let output = medic()
        .args([
            "compare",
            "--tasks",
            "6",
            "--processor-failure-rate",
            "0",
            "--gateway-failure-rate",
            "0",
            "--analytics-failure-rate",
            "0",
            "--json",
            "--log-level",
            "error",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["baseline_success_rate"], 1.0);
    assert_eq!(report["healing_success_rate"], 1.0);
    assert_eq!(report["improvement_pct"], 0.0);
    assert_eq!(report["baseline"].as_array().map(Vec::len), Some(3));
    assert_eq!(report["baseline"][0]["status"], "healthy");
    assert_eq!(report["healing"]["stats"]["completed"], 6);
}

/// Out-of-range failure rates are refused
#[test]
fn test_simulate_rejects_bad_rate() {
    medic()
        .args(["simulate", "--tasks", "3", "--processor-failure-rate", "1.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failure rate"));
}
