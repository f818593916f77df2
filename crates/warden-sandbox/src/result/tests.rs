//! Tests for result rendering.

use std::time::Duration;

use rstest::rstest;

use super::*;

#[rstest]
#[case::exit(Outcome::Ok { exit_code: 3 }, "exited with status 3 after 1.500s")]
#[case::setup(
    Outcome::SetupError { message: String::from("pivot_root: Operation not permitted") },
    "setup failed: pivot_root: Operation not permitted after 1.500s"
)]
#[case::network(
    Outcome::Violation(Violation::Network { description: String::from("10.0.0.1:22") }),
    "network violation: connection to 10.0.0.1:22 refused after 1.500s"
)]
#[case::signal(Outcome::Signaled { signal: 9 }, "killed by signal 9 after 1.500s")]
#[case::timeout(Outcome::Timeout, "wall-time limit exceeded after 1.500s")]
#[case::kill(Outcome::ExternalKill, "killed on request after 1.500s")]
fn results_describe_how_the_run_ended(#[case] outcome: Outcome, #[case] expected: &str) {
    let result = SandboxResult::new(outcome, Duration::from_millis(1500));
    assert_eq!(result.to_string(), expected);
}

#[rstest]
fn syscall_violation_names_the_syscall() {
    let nr = warden_policy::syscalls::nr(libc::SYS_ptrace);
    let violation = Violation::syscall(nr);
    assert_eq!(
        violation.to_string(),
        format!("syscall violation: ptrace ({nr})")
    );
    assert_eq!(
        violation,
        Violation::Syscall {
            nr,
            name: Some(String::from("ptrace")),
        }
    );
}

#[rstest]
fn accessors_match_the_outcome() {
    let ok = SandboxResult::new(Outcome::Ok { exit_code: 0 }, Duration::ZERO);
    assert!(ok.is_success());
    assert_eq!(ok.exit_code(), Some(0));
    assert!(ok.violation().is_none());

    let failed = SandboxResult::new(Outcome::Ok { exit_code: 1 }, Duration::ZERO);
    assert!(!failed.is_success());

    let violated = SandboxResult::new(Outcome::Violation(Violation::syscall(1)), Duration::ZERO);
    assert!(violated.violation().is_some());
    assert_eq!(violated.exit_code(), None);
}

#[rstest]
fn results_serialise_for_logging() {
    let result = SandboxResult::new(Outcome::Timeout, Duration::from_secs(2));
    let json = serde_json::to_value(&result).expect("serialise");
    assert_eq!(json.get("outcome"), Some(&serde_json::json!("Timeout")));
}
