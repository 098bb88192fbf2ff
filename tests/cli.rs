//! CLI surface tests.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn overseer() -> Command {
    cargo_bin_cmd!("overseer")
}

#[test]
fn test_help_lists_subcommands() {
    overseer()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("trigger"))
        .stdout(predicate::str::contains("jobs"))
        .stdout(predicate::str::contains("cancel"))
        .stdout(predicate::str::contains("logs"));
}

#[test]
fn test_version() {
    overseer().arg("--version").assert().success();
}

#[test]
fn test_jobs_on_empty_store() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("overseer.toml"),
        format!("data_dir = {:?}\n", dir.path().join("data")),
    )
    .unwrap();

    overseer()
        .current_dir(dir.path())
        .arg("jobs")
        .assert()
        .success()
        .stdout(predicate::str::contains("No jobs"));
}

#[test]
fn test_unknown_job_id_is_an_error() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("overseer.toml"),
        format!("data_dir = {:?}\n", dir.path().join("data")),
    )
    .unwrap();

    overseer()
        .current_dir(dir.path())
        .args(["show", "ghost-1-plan"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost-1-plan"));
}

#[test]
fn test_trigger_rejects_bad_command_name() {
    overseer()
        .args(["trigger", "acme/widget", "7", "deploy"])
        .assert()
        .failure();
}
