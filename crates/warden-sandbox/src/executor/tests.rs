//! Unit tests for executor descriptions and fork planning.

use std::fs::{self, File};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::time::Duration;

use rstest::{fixture, rstest};
use tempfile::NamedTempFile;
use warden_comms::Comms;
use warden_policy::{ExecGuard, Policy, PolicyBuilder};

use super::child::{Failure, Stage, read_failure};
use super::plan::{ChildPlan, MountOp};
use super::*;

const TRUE_BINARY: &str = "/bin/true";

fn plain_policy() -> Policy {
    PolicyBuilder::new().allow_exit().disable_namespaces().build_or_die()
}

fn prepare(executor: Executor, policy: &Policy) -> Result<ChildPlan, SandboxError> {
    let program = policy.compile(&ExecGuard::reserved()).expect("compile");
    let (_host, sandboxee) = Comms::pair().expect("pair");
    ChildPlan::prepare(executor, policy, program, sandboxee.into_fd(), None)
}

#[fixture]
fn executor() -> Executor {
    Executor::new(TRUE_BINARY)
}

#[rstest]
fn argv0_defaults_to_the_path(executor: Executor) {
    assert_eq!(executor.args(), [TRUE_BINARY]);
    assert!(executor.environment().is_empty());
}

#[rstest]
fn env_replaces_earlier_values(executor: Executor) {
    let executor = executor.env("A", "1").env("B", "2").env("A", "3");
    assert_eq!(
        executor.environment(),
        [
            (String::from("A"), String::from("3")),
            (String::from("B"), String::from("2"))
        ]
    );
}

#[rstest]
fn zero_wall_time_means_unlimited() {
    let limits = Limits::new().with_wall_time(Some(Duration::ZERO));
    assert_eq!(limits.wall_time(), None);
    let limits = limits.with_wall_time(Some(Duration::from_secs(2)));
    assert_eq!(limits.wall_time(), Some(Duration::from_secs(2)));
}

#[rstest]
#[case::relative_path(Executor::new("bin/true"))]
#[case::empty_args(Executor::new(TRUE_BINARY).with_args(Vec::<String>::new()))]
#[case::relative_cwd(Executor::new(TRUE_BINARY).cwd("tmp"))]
#[case::empty_env_key(Executor::new(TRUE_BINARY).env("", "x"))]
#[case::env_key_with_equals(Executor::new(TRUE_BINARY).env("A=B", "x"))]
fn validate_rejects_unusable_descriptions(#[case] executor: Executor) {
    assert!(matches!(
        executor.validate(),
        Err(SandboxError::InvalidExecutor { .. })
    ));
}

#[rstest]
#[case::reserved(SANDBOXEE_COMMS_FD)]
#[case::negative(-1)]
fn validate_rejects_bad_fd_targets(executor: Executor, #[case] target: RawFd) {
    let file = tempfile::tempfile().expect("tempfile");
    let executor = executor.map_fd(file.into(), target);
    assert!(executor.validate().is_err());
}

#[rstest]
fn validate_rejects_duplicate_targets(executor: Executor) {
    let first = tempfile::tempfile().expect("tempfile");
    let second = tempfile::tempfile().expect("tempfile");
    let executor = executor.map_fd(first.into(), 5).map_fd(second.into(), 5);
    assert!(executor.validate().is_err());
}

#[rstest]
fn plan_moves_channels_to_reserved_numbers(executor: Executor) {
    let plan = prepare(executor, &plain_policy()).expect("plan");
    let targets: Vec<RawFd> = plan.moves.iter().map(|&(_, target)| target).collect();
    assert_eq!(targets, [SANDBOXEE_EXEC_FD, SANDBOXEE_COMMS_FD]);
    for &(source, _) in &plan.moves {
        assert!(source > 2, "source {source} collides with stdio");
        assert!(!RESERVED_FDS.contains(&source));
    }
    assert!(plan.keep.contains(&plan.status_write.as_raw_fd()));
    assert!(plan.keep.starts_with(&[0, 1, 2]));
    assert!(plan.namespaces.is_none());
    assert!(plan.sync.is_none());
}

#[rstest]
fn null_stdio_and_user_maps_are_planned(executor: Executor) {
    let file = tempfile::tempfile().expect("tempfile");
    let executor = executor
        .stdout(StdioMode::Null)
        .stderr(StdioMode::Null)
        .map_fd(file.into(), 7);
    let plan = prepare(executor, &plain_policy()).expect("plan");
    let targets: Vec<RawFd> = plan.moves.iter().map(|&(_, target)| target).collect();
    assert_eq!(targets, [SANDBOXEE_EXEC_FD, SANDBOXEE_COMMS_FD, 1, 2, 7]);
    assert!(plan.moves.iter().all(|&(source, _)| source != 7));
}

#[rstest]
fn rlimits_always_disable_core_dumps(executor: Executor) {
    let executor = executor.limits(Limits::new().with_address_space(1 << 30));
    let plan = prepare(executor, &plain_policy()).expect("plan");
    assert!(plan.rlimits.contains(&(libc::RLIMIT_CORE, 0)));
    assert!(plan.rlimits.contains(&(libc::RLIMIT_AS, 1 << 30)));
    assert_eq!(plan.rlimits.len(), 2);
}

#[rstest]
fn missing_binary_is_reported(executor: Executor) {
    let executor = Executor::new("/nonexistent/warden-binary").with_args(executor.args().to_vec());
    let error = prepare(executor, &plain_policy()).expect_err("missing binary");
    assert!(matches!(error, SandboxError::OpenBinary { .. }));
}

#[rstest]
fn namespace_plan_lists_mount_steps_in_order(executor: Executor) {
    let host_file = NamedTempFile::new().expect("temp file");
    let outside = host_file.path().to_str().expect("utf-8 path");
    let policy = PolicyBuilder::new()
        .allow_exit()
        .add_file_at(outside, "/data/in.txt", true)
        .add_tmpfs("/scratch", 4096)
        .build_or_die();
    let plan = prepare(executor, &policy).expect("plan");
    let namespaces = plan.namespaces.as_ref().expect("namespaces");
    assert_ne!(namespaces.flags & libc::CLONE_NEWNET, 0);
    assert_eq!(namespaces.hostname, b"warden");

    let steps: Vec<&str> = namespaces
        .mounts
        .iter()
        .map(|op| match op {
            MountOp::Mkdir(_) => "mkdir",
            MountOp::Touch(_) => "touch",
            MountOp::Bind { .. } => "bind",
            MountOp::RemountReadOnly { .. } => "remount-ro",
            MountOp::Tmpfs { .. } => "tmpfs",
        })
        .collect();
    assert_eq!(
        steps,
        ["mkdir", "touch", "bind", "remount-ro", "mkdir", "tmpfs"]
    );
    assert!(
        namespaces
            .describe_mount(1)
            .expect("description")
            .ends_with("/data/in.txt")
    );
    fs::remove_dir(&namespaces.root_dir).expect("remove root");
}

#[rstest]
fn unrestricted_networking_keeps_the_host_network(executor: Executor) {
    let policy = PolicyBuilder::new()
        .allow_exit()
        .allow_unrestricted_networking()
        .build_or_die();
    let plan = prepare(executor, &policy).expect("plan");
    let namespaces = plan.namespaces.as_ref().expect("namespaces");
    assert_eq!(namespaces.flags & libc::CLONE_NEWNET, 0);
    fs::remove_dir(&namespaces.root_dir).expect("remove root");
}

#[rstest]
fn closed_status_pipe_means_exec_succeeded(executor: Executor) {
    let plan = prepare(executor, &plain_policy()).expect("plan");
    let ChildPlan {
        status_read,
        status_write,
        ..
    } = plan;
    drop(status_write);
    assert_eq!(read_failure(status_read).expect("read"), None);
}

#[rstest]
fn failure_records_survive_the_pipe(executor: Executor) {
    let plan = prepare(executor, &plain_policy()).expect("plan");
    let failure = Failure {
        stage: Stage::Chdir,
        errno: libc::ENOENT,
        index: 0,
    };
    let message = failure.describe(plan.namespaces.as_ref());
    let ChildPlan {
        status_read,
        status_write,
        ..
    } = plan;
    File::from(status_write)
        .write_all(&failure.encode())
        .expect("write record");
    assert_eq!(read_failure(status_read).expect("read"), Some(failure));
    assert!(message.starts_with("changing directory"), "{message}");
}
