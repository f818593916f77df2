//! Integration tests for the `warden` binary entry point.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use warden_cli::EXIT_VIOLATION;
use warden_testcases::require_tracing;

#[test]
fn help_lists_the_subcommands() {
    let mut command = cargo_bin_cmd!("warden");
    command.arg("--help");
    command
        .assert()
        .success()
        .stdout(contains("run"))
        .stdout(contains("syscalls"));
}

#[test]
fn missing_binary_is_a_usage_error() {
    let mut command = cargo_bin_cmd!("warden");
    command.arg("run");
    command.assert().code(2).stderr(contains("BINARY"));
}

#[test]
fn malformed_environment_configuration_fails_fast() {
    let mut command = cargo_bin_cmd!("warden");
    command.env("WARDEN_MAX_MSG_SIZE", "lots").args(["syscalls", "read"]);
    command.assert().failure().stderr(contains("configuration"));
}

#[test]
fn permissive_policy_runs_to_completion() {
    require_tracing!();
    let mut command = cargo_bin_cmd!("warden");
    command.args(["run", "--no-namespaces", "--allow-all", "/bin/true"]);
    command.assert().success();
}

#[test]
fn unlisted_syscalls_end_the_run_as_a_violation() {
    require_tracing!();
    let mut command = cargo_bin_cmd!("warden");
    command.args(["run", "--no-namespaces", "--startup", "none", "/bin/true"]);
    command
        .assert()
        .code(i32::from(EXIT_VIOLATION))
        .stderr(contains("syscall violation"));
}
