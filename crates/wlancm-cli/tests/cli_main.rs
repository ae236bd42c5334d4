//! Basic CLI tests for the wlancm simulator.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

/// Test that the CLI binary exists and shows help.
#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("wlancm").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("show-config"));
}

/// Test that providing no subcommand shows an error.
#[test]
fn test_no_subcommand_shows_error() {
    let mut cmd = Command::cargo_bin("wlancm").unwrap();

    cmd.assert().failure();
}

#[test]
fn test_simulate_hw_mode_prints_lifecycle() {
    let mut cmd = Command::cargo_bin("wlancm").unwrap();
    cmd.args(["simulate", "--scenario", "hw-mode"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("set_hw_mode -> Ok"))
        .stdout(predicate::str::contains("antenna_mode -> Ok"))
        .stdout(predicate::str::contains("Activated"))
        .stdout(predicate::str::contains("completed=4"));
}

#[test]
fn test_simulate_twt_json_events() {
    let mut cmd = Command::cargo_bin("wlancm").unwrap();
    cmd.args(["simulate", "--scenario", "twt", "--json"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"event_type\":\"Completed\""))
        .stdout(predicate::str::contains("teardown -> Ok"));
}

#[test]
fn test_simulate_roam() {
    let mut cmd = Command::cargo_bin("wlancm").unwrap();
    cmd.args(["simulate", "--scenario", "roam", "--bssid", "02:aa:00:00:00:10"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("associated with 02:aa:00:00:00:11"));
}

#[test]
fn test_invalid_bssid_rejected() {
    let mut cmd = Command::cargo_bin("wlancm").unwrap();
    cmd.args(["simulate", "--scenario", "roam", "--bssid", "not-a-mac"]);

    cmd.assert().failure();
}

#[test]
fn test_show_config_reads_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "command_pool_size = 12").unwrap();

    let mut cmd = Command::cargo_bin("wlancm").unwrap();
    cmd.env_remove("WLANCM_COMMAND_POOL_SIZE")
        .arg("--config")
        .arg(file.path())
        .arg("show-config");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("command_pool_size = 12"))
        .stdout(predicate::str::contains("policy_mgr_ms = 4000"));
}

#[test]
fn test_invalid_config_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "command_pool_size = 0").unwrap();

    let mut cmd = Command::cargo_bin("wlancm").unwrap();
    cmd.env_remove("WLANCM_COMMAND_POOL_SIZE")
        .arg("--config")
        .arg(file.path())
        .arg("show-config");

    cmd.assert().failure();
}
