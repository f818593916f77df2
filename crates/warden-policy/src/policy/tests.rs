//! Tests for policy compilation.

use rstest::rstest;

use super::*;
use crate::bpf::{SECCOMP_RET_ALLOW, SECCOMP_RET_TRACE, SeccompData, VIOLATION_TRACE_DATA};
use crate::PolicyBuilder;

fn execveat(fd: u64, flags: u64) -> SeccompData {
    SeccompData::new(
        syscalls::nr(libc::SYS_execveat),
        [fd, 0, 0, 0, flags, 0],
    )
}

const EMPTY_PATH: u64 = libc::AT_EMPTY_PATH as u64;

#[rstest]
fn exec_guard_permits_only_the_reserved_exec() {
    let policy = PolicyBuilder::new().build_or_die();
    let program = policy.compile(&ExecGuard::reserved()).expect("compile");
    let reserved = u64::from(SANDBOXEE_EXEC_FD.cast_unsigned());
    let violation = SECCOMP_RET_TRACE | VIOLATION_TRACE_DATA;

    assert_eq!(program.evaluate(&execveat(reserved, EMPTY_PATH)), SECCOMP_RET_ALLOW);
    assert_eq!(program.evaluate(&execveat(reserved, 0)), violation);
    assert_eq!(program.evaluate(&execveat(3, EMPTY_PATH)), violation);
}

#[rstest]
fn exec_guard_ignores_upper_argument_bits() {
    let policy = PolicyBuilder::new().build_or_die();
    let program = policy.compile(&ExecGuard::new(7)).expect("compile");
    let sign_extended = 0xffff_ffff_0000_0000 | 7;
    assert_eq!(
        program.evaluate(&execveat(sign_extended, EMPTY_PATH)),
        SECCOMP_RET_ALLOW
    );
}

#[rstest]
fn exec_guard_precedes_policy_rules() {
    let policy = PolicyBuilder::new()
        .block_syscall_with_errno(libc::SYS_execveat, libc::EPERM)
        .build_or_die();
    let program = policy.compile(&ExecGuard::reserved()).expect("compile");
    let reserved = u64::from(SANDBOXEE_EXEC_FD.cast_unsigned());
    assert_eq!(program.evaluate(&execveat(reserved, EMPTY_PATH)), SECCOMP_RET_ALLOW);
}

#[rstest]
fn defaults_are_namespaced_without_network() {
    let policy = PolicyBuilder::new().build_or_die();
    assert!(policy.namespaces_enabled());
    assert_eq!(policy.hostname(), DEFAULT_HOSTNAME);
    assert!(!policy.network_proxy_enabled());
    assert!(!policy.unrestricted_networking());
    assert_eq!(policy.default_action(), Action::Violation);
    assert!(policy.mounts().is_empty());
}
