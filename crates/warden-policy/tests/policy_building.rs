//! Behaviour tests for building and compiling policies.

use std::fs;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

use warden_policy::bpf::{
    SECCOMP_RET_ALLOW, SECCOMP_RET_ERRNO, SECCOMP_RET_TRACE, SeccompData, VIOLATION_TRACE_DATA,
};
use warden_policy::{ExecGuard, Policy, PolicyBuilder, PolicyError, syscalls};
use warden_util::StatusCode;

struct World {
    host: TempDir,
    builder: Option<PolicyBuilder>,
    last_file: Option<String>,
    outcome: Option<Result<Policy, PolicyError>>,
}

impl World {
    fn update(&mut self, step: impl FnOnce(PolicyBuilder) -> PolicyBuilder) {
        let builder = self.builder.take().unwrap_or_default();
        self.builder = Some(step(builder));
    }

    fn new_host_file(&mut self) -> String {
        let index = fs::read_dir(self.host.path()).expect("list host dir").count();
        let path = self.host.path().join(format!("file-{index}"));
        fs::write(&path, "contents").expect("write host file");
        let path = path.to_str().expect("utf8 path").to_owned();
        self.last_file = Some(path.clone());
        path
    }

    fn policy(&self) -> &Policy {
        match self.outcome.as_ref().expect("policy was built") {
            Ok(policy) => policy,
            Err(error) => panic!("policy failed to build: {error}"),
        }
    }

    fn verdict(&self, name: &str) -> u32 {
        let nr = syscalls::number(name).expect("known syscall");
        let program = self
            .policy()
            .compile(&ExecGuard::reserved())
            .expect("compile");
        program.evaluate(&SeccompData::new(nr, [0; 6]))
    }
}

#[fixture]
fn world() -> World {
    World {
        host: TempDir::new().expect("tempdir"),
        builder: None,
        last_file: None,
        outcome: None,
    }
}

fn syscall_number(name: &str) -> libc::c_long {
    libc::c_long::from(syscalls::number(name.trim_matches('"')).expect("known syscall"))
}

#[given("a builder allowing the read group")]
fn given_read_group(world: &mut World) {
    world.update(PolicyBuilder::allow_read);
}

#[given("a builder blocking {name} with errno {errno}")]
fn given_blocked(world: &mut World, name: String, errno: i32) {
    let nr = syscall_number(&name);
    world.update(|builder| builder.block_syscall_with_errno(nr, errno));
}

#[given("a host file mounted at {inside}")]
fn given_host_file(world: &mut World, inside: String) {
    let outside = world.new_host_file();
    world.update(|builder| builder.add_file_at(&outside, inside.trim_matches('"'), true));
}

#[given("another host file mounted at {inside}")]
fn given_other_host_file(world: &mut World, inside: String) {
    given_host_file(world, inside);
}

#[given("the same host file mounted again at {inside}")]
fn given_same_host_file(world: &mut World, inside: String) {
    let outside = world.last_file.clone().expect("a host file was mounted");
    world.update(|builder| builder.add_file_at(&outside, inside.trim_matches('"'), true));
}

#[when("the policy is built")]
fn when_built(world: &mut World) {
    let builder = world.builder.take().unwrap_or_default();
    world.outcome = Some(builder.try_build());
}

#[then("syscall {name} is allowed")]
fn then_allowed(world: &mut World, name: String) {
    assert_eq!(world.verdict(name.trim_matches('"')), SECCOMP_RET_ALLOW);
}

#[then("syscall {name} is reported as a violation")]
fn then_violation(world: &mut World, name: String) {
    assert_eq!(
        world.verdict(name.trim_matches('"')),
        SECCOMP_RET_TRACE | VIOLATION_TRACE_DATA
    );
}

#[then("syscall {name} fails with errno {errno}")]
fn then_errno(world: &mut World, name: String, errno: u32) {
    assert_eq!(
        world.verdict(name.trim_matches('"')),
        SECCOMP_RET_ERRNO | errno
    );
}

#[then("building fails with a failed precondition")]
fn then_failed_precondition(world: &mut World) {
    match world.outcome.as_ref().expect("policy was built") {
        Ok(_) => panic!("expected the build to fail"),
        Err(error) => assert_eq!(error.code(), StatusCode::FailedPrecondition, "{error}"),
    }
}

#[then("the policy has {count} mount")]
fn then_mount_count(world: &mut World, count: usize) {
    assert_eq!(world.policy().mounts().len(), count);
}

#[scenario(path = "tests/features/policy_building.feature")]
fn policy_building_behaviour(world: World) {
    let _ = world;
}
