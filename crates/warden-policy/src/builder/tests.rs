//! Unit tests for the policy builder.

use rstest::rstest;
use warden_comms::SANDBOXEE_NETWORK_PROXY_FD;

use super::*;
use crate::bpf::{
    MAX_INSTRUCTIONS, SECCOMP_RET_ALLOW, SECCOMP_RET_ERRNO, SECCOMP_RET_TRACE, SeccompData,
    VIOLATION_TRACE_DATA,
};
use crate::error::MountError;

fn verdict(policy: &Policy, nr: libc::c_long, args: [u64; 6]) -> u32 {
    let program = policy.compile(&ExecGuard::reserved()).expect("compile");
    program.evaluate(&SeccompData::new(syscalls::nr(nr), args))
}

const VIOLATION: u32 = SECCOMP_RET_TRACE | VIOLATION_TRACE_DATA;

/// `F_SETSIG` from `<fcntl.h>`; the `libc` crate omits it for glibc targets.
const F_SETSIG: libc::c_int = 10;

#[rstest]
fn group_allows_its_syscalls_only() {
    let policy = PolicyBuilder::new().allow_read().build_or_die();
    assert_eq!(verdict(&policy, libc::SYS_read, [0; 6]), SECCOMP_RET_ALLOW);
    assert_eq!(verdict(&policy, libc::SYS_preadv, [0; 6]), SECCOMP_RET_ALLOW);
    assert_eq!(
        verdict(&policy, libc::SYS_write, [1, 0, 0, 0, 0, 0]),
        VIOLATION
    );
}

#[rstest]
#[case::getfd(libc::F_GETFD, true)]
#[case::dupfd_cloexec(libc::F_DUPFD_CLOEXEC, true)]
#[case::setlkw(libc::F_SETLKW, true)]
#[case::setown(libc::F_SETOWN, false)]
#[case::setsig(F_SETSIG, false)]
fn safe_fcntl_filters_commands(#[case] command: i32, #[case] allowed: bool) {
    let policy = PolicyBuilder::new().allow_safe_fcntl().build_or_die();
    let args = [3, u64::from(command.cast_unsigned()), 0, 0, 0, 0];
    let expected = if allowed {
        SECCOMP_RET_ALLOW
    } else {
        VIOLATION
    };
    assert_eq!(verdict(&policy, libc::SYS_fcntl, args), expected);
}

#[rstest]
#[case::plain(libc::FUTEX_WAIT, true)]
#[case::private(libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG, true)]
#[case::realtime(libc::FUTEX_WAIT | libc::FUTEX_CLOCK_REALTIME, true)]
#[case::other_op(libc::FUTEX_REQUEUE, false)]
fn futex_op_ignores_modifier_bits(#[case] op: i32, #[case] allowed: bool) {
    let policy = PolicyBuilder::new()
        .allow_futex_op(libc::FUTEX_WAIT)
        .build_or_die();
    let args = [0x1000, u64::from(op.cast_unsigned()), 0, 0, 0, 0];
    let expected = if allowed {
        SECCOMP_RET_ALLOW
    } else {
        VIOLATION
    };
    assert_eq!(verdict(&policy, libc::SYS_futex, args), expected);
}

#[cfg(target_arch = "x86_64")]
#[rstest]
fn static_startup_sets_fs_and_refuses_other_codes() {
    let policy = PolicyBuilder::new().allow_static_startup().build_or_die();
    assert_eq!(
        verdict(&policy, libc::SYS_arch_prctl, [ARCH_SET_FS, 0, 0, 0, 0, 0]),
        SECCOMP_RET_ALLOW
    );
    assert_eq!(
        verdict(&policy, libc::SYS_arch_prctl, [0x3001, 0, 0, 0, 0, 0]),
        SECCOMP_RET_ERRNO | u32::from(ARCH_PRCTL_FALLBACK_ERRNO)
    );
}

#[rstest]
fn tcgets_is_the_only_ioctl() {
    let policy = PolicyBuilder::new().allow_tcgets().build_or_die();
    assert_eq!(
        verdict(&policy, libc::SYS_ioctl, [0, TCGETS, 0, 0, 0, 0]),
        SECCOMP_RET_ALLOW
    );
    assert_eq!(
        verdict(&policy, libc::SYS_ioctl, [0, 0x5412, 0, 0, 0, 0]),
        VIOLATION
    );
}

#[rstest]
fn syscall_on_fd_checks_the_descriptor() {
    let policy = PolicyBuilder::new()
        .allow_syscall_on_fd(libc::SYS_close, 5)
        .build_or_die();
    assert_eq!(verdict(&policy, libc::SYS_close, [5, 0, 0, 0, 0, 0]), SECCOMP_RET_ALLOW);
    assert_eq!(
        verdict(&policy, libc::SYS_close, [6, 0, 0, 0, 0, 0]),
        VIOLATION
    );
}

#[rstest]
fn blocked_syscalls_fail_with_errno() {
    let policy = PolicyBuilder::new()
        .block_syscalls_with_errno(&[libc::SYS_ptrace, libc::SYS_bpf], libc::EPERM)
        .build_or_die();
    let expected = SECCOMP_RET_ERRNO | libc::EPERM.cast_unsigned();
    assert_eq!(verdict(&policy, libc::SYS_ptrace, [0; 6]), expected);
    assert_eq!(verdict(&policy, libc::SYS_bpf, [0; 6]), expected);
}

#[rstest]
#[case::too_large(5000)]
#[case::negative(-1)]
fn out_of_range_errno_is_rejected(#[case] errno: i32) {
    let error = PolicyBuilder::new()
        .block_syscall_with_errno(libc::SYS_ptrace, errno)
        .try_build()
        .expect_err("errno out of range");
    assert!(matches!(error, PolicyError::InvalidErrno { .. }));
}

#[rstest]
fn earlier_rules_take_precedence() {
    let policy = PolicyBuilder::new()
        .block_syscall_with_errno(libc::SYS_getpid, libc::EACCES)
        .allow_get_pids()
        .build_or_die();
    assert_eq!(
        verdict(&policy, libc::SYS_getpid, [0; 6]),
        SECCOMP_RET_ERRNO | libc::EACCES.cast_unsigned()
    );
    assert_eq!(verdict(&policy, libc::SYS_gettid, [0; 6]), SECCOMP_RET_ALLOW);
}

#[rstest]
fn default_allow_all_allows_unlisted_syscalls() {
    let policy = PolicyBuilder::new().danger_default_allow_all().build_or_die();
    assert_eq!(verdict(&policy, libc::SYS_ptrace, [0; 6]), SECCOMP_RET_ALLOW);
}

#[rstest]
fn first_mount_error_is_reported() {
    let error = PolicyBuilder::new()
        .add_file("relative")
        .add_file("")
        .try_build()
        .expect_err("bad mount");
    assert!(matches!(
        error,
        PolicyError::Mount(MountError::RelativePath { .. })
    ));
}

#[rstest]
fn mounts_require_namespaces() {
    let error = PolicyBuilder::new()
        .disable_namespaces()
        .add_tmpfs("/tmp", 4096)
        .try_build()
        .expect_err("mounts without namespaces");
    assert!(matches!(error, PolicyError::MountsWithoutNamespaces));
}

#[rstest]
fn hosts_require_the_proxy() {
    let error = PolicyBuilder::new()
        .allow_ipv4("127.0.0.1", None)
        .try_build()
        .expect_err("hosts without proxy");
    assert!(matches!(error, PolicyError::HostsWithoutProxy));
}

#[rstest]
fn proxy_excludes_unrestricted_networking() {
    let error = PolicyBuilder::new()
        .add_network_proxy_policy()
        .allow_unrestricted_networking()
        .try_build()
        .expect_err("conflicting network settings");
    assert!(matches!(error, PolicyError::ProxyWithUnrestrictedNetworking));
}

#[rstest]
fn malformed_host_is_reported() {
    let error = PolicyBuilder::new()
        .add_network_proxy_policy()
        .allow_ipv4("300.1.1.1", None)
        .try_build()
        .expect_err("bad address");
    assert!(matches!(error, PolicyError::Hosts(_)));
}

#[rstest]
fn proxy_policy_exposes_hosts_and_pins_the_proxy_fd() {
    let policy = PolicyBuilder::new()
        .add_network_proxy_policy()
        .allow_ipv4("127.0.0.1", Some(80))
        .allow_ipv6("::1", None)
        .build_or_die();
    let hosts = policy.allowed_hosts().expect("proxy enabled");
    assert_eq!(hosts.len(), 2);

    let proxy_fd = u64::from(SANDBOXEE_NETWORK_PROXY_FD.cast_unsigned());
    assert_eq!(
        verdict(&policy, libc::SYS_sendmsg, [proxy_fd, 0, 0, 0, 0, 0]),
        SECCOMP_RET_ALLOW
    );
    assert_eq!(
        verdict(&policy, libc::SYS_recvmsg, [4, 0, 0, 0, 0, 0]),
        VIOLATION
    );
}

#[rstest]
#[case::empty("")]
#[case::too_long(&"h".repeat(65))]
#[case::nul("a\0b")]
fn invalid_hostnames_are_rejected(#[case] hostname: &str) {
    let error = PolicyBuilder::new()
        .set_hostname(hostname)
        .try_build()
        .expect_err("bad hostname");
    assert!(matches!(error, PolicyError::InvalidHostname { .. }));
}

#[rstest]
fn every_group_together_fits_the_kernel_limits() {
    let policy = PolicyBuilder::new()
        .allow_runtime_startup()
        .allow_system_malloc()
        .allow_write()
        .allow_exit()
        .allow_get_ids()
        .allow_safe_fcntl()
        .allow_llvm_sanitizers()
        .allow_handle_signals()
        .allow_time()
        .allow_sleep()
        .allow_tcgets()
        .add_network_proxy_policy()
        .build_or_die();
    let program = policy.compile(&ExecGuard::reserved()).expect("compile");
    assert!(
        program
            .filters()
            .iter()
            .all(|filter| filter.len() < MAX_INSTRUCTIONS)
    );
}

#[rstest]
#[should_panic(expected = "invalid sandbox policy")]
fn build_or_die_panics_on_errors() {
    let _policy = PolicyBuilder::new().add_file("").build_or_die();
}
