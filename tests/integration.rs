//! Integration tests for the jobspawn CLI.
//!
//! These tests verify the binary behavior end-to-end: the `run` command
//! spawns real worker subprocesses of the same binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::tempdir;

/// Get a command for the jobspawn binary.
fn jobspawn() -> Command {
    Command::cargo_bin("jobspawn").unwrap()
}

#[test]
fn test_help_shows_run_command() {
    jobspawn()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("worker-process pool"));
}

#[test]
fn test_run_with_no_files_exits_cleanly() {
    jobspawn()
        .args(["--log-level", "error", "run", "--workers", "1"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();
}

#[test]
fn test_run_upper_with_post_append() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("results.txt");

    jobspawn()
        .args([
            "--log-level",
            "error",
            "run",
            "--workers",
            "2",
            "--module",
            "builtin",
            "--function",
            "upper",
            "--post-module",
            "builtin",
            "--post-function",
            "append",
            "--post-params",
            out.to_str().unwrap(),
            "alpha",
            "bravo",
            "charlie",
        ])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();

    let mut lines: Vec<String> = std::fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(String::from)
        .collect();
    lines.sort();
    assert_eq!(lines, vec!["ALPHA", "BRAVO", "CHARLIE"]);
}

#[test]
fn test_run_stat_on_real_files() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("scan.dat");
    let mut f = std::fs::File::create(&data).unwrap();
    f.write_all(b"0123456789").unwrap();

    jobspawn()
        .args([
            "--log-level",
            "error",
            "run",
            "--workers",
            "1",
            "--module",
            "builtin",
            "--function",
            "stat",
        ])
        .arg(data.to_str().unwrap())
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stderr(predicate::str::contains("Job failed").not());
}

#[test]
fn test_run_with_unresolvable_function_still_succeeds() {
    jobspawn()
        .args([
            "--log-level",
            "error",
            "run",
            "--workers",
            "1",
            "--module",
            "no_such_module",
            "--function",
            "missing",
            "ghost.h5",
        ])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stderr(predicate::str::contains("Cannot resolve processing task"));
}

#[test]
fn test_completions_bash() {
    jobspawn()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("jobspawn"));
}

#[test]
fn test_rejects_unknown_subcommand() {
    jobspawn().arg("frobnicate").assert().failure();
}
