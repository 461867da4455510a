//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn cli_without_arguments_prints_help() {
    let mut cmd = cargo_bin_cmd!("hostwright");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn help_lists_every_lifecycle_command() {
    let mut cmd = cargo_bin_cmd!("hostwright");
    let assert = cmd.arg("--help").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();

    for command in [
        "create", "start", "stop", "restart", "kill", "remove", "state", "ip", "url", "ssh-info",
    ] {
        assert!(output.contains(command), "{command} missing from help:\n{output}");
    }
}

#[test]
fn commands_on_unrecorded_hosts_fail_cleanly() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let store = tmp.path().join("hosts");

    let mut cmd = cargo_bin_cmd!("hostwright");
    cmd.current_dir(tmp.path())
        .env("HOME", tmp.path())
        .env("HOSTWRIGHT_STORE_DIR", &store)
        .args(["state", "web-1"])
        .assert()
        .code(1)
        .stdout("")
        .stderr(predicate::str::contains("error: no record for host web-1"));
}

#[test]
fn invalid_host_names_are_rejected_before_any_request() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));

    let mut cmd = cargo_bin_cmd!("hostwright");
    cmd.current_dir(tmp.path())
        .env("HOME", tmp.path())
        .env("HOSTWRIGHT_PROJECT", "11111111-2222-3333-4444-555555555555")
        .env("HOSTWRIGHT_STORE_DIR", tmp.path().join("hosts"))
        .env("SCW_SECRET_KEY", "SCWSECRETKEYEXAMPLE")
        .args(["create", "Web_1"])
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("error: invalid host name"));
}

#[test]
fn create_without_any_project_names_both_sources() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));

    let mut cmd = cargo_bin_cmd!("hostwright");
    cmd.current_dir(tmp.path())
        .env("HOME", tmp.path())
        .env_remove("HOSTWRIGHT_PROJECT")
        .env_remove("SCW_DEFAULT_PROJECT_ID")
        .env("SCW_SECRET_KEY", "SCWSECRETKEYEXAMPLE")
        .env("HOSTWRIGHT_STORE_DIR", tmp.path().join("hosts"))
        .args(["create", "web-1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("SCW_DEFAULT_PROJECT_ID"));
}
