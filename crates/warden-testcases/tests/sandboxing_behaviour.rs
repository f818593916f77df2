//! Behaviour tests for running `testee_basic` in namespaces.

#![expect(clippy::print_stderr, reason = "skipped scenarios say why")]

use std::fs;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;
use warden_config::Config;
use warden_policy::PolicyBuilder;
use warden_sandbox::{Executor, Monitor, SandboxResult, Violation};
use warden_testcases::{capabilities, rust_runtime_policy};

const TESTEE: &str = env!("CARGO_BIN_EXE_testee_basic");

#[derive(Default)]
struct World {
    supported: bool,
    dir: Option<TempDir>,
    builder: Option<PolicyBuilder>,
    result: Option<SandboxResult>,
}

impl World {
    fn run(&mut self, args: &[&str]) {
        if !self.supported {
            return;
        }
        let policy = self
            .builder
            .take()
            .expect("policy configured")
            .try_build()
            .expect("policy");
        let executor = Executor::new(TESTEE).with_args(args.iter().copied());
        self.result = Some(Monitor::run(executor, &policy, &Config::default()).expect("run"));
    }

    fn result(&self) -> Option<&SandboxResult> {
        if !self.supported {
            return None;
        }
        Some(self.result.as_ref().expect("sandboxee ran"))
    }
}

#[fixture]
fn world() -> World {
    World::default()
}

#[given("a policy that maps {contents} read-only at {inside}")]
fn given_policy(world: &mut World, contents: String, inside: String) {
    world.supported = capabilities().namespaces;
    if !world.supported {
        eprintln!("Skipping scenario: unprivileged user namespaces are unavailable");
        return;
    }
    let dir = TempDir::new().expect("temp dir");
    let host = dir.path().join("mapped");
    fs::write(&host, contents.trim_matches('"')).expect("write mapped file");
    let builder = rust_runtime_policy()
        .add_mappings_for_binary(TESTEE, "")
        .add_file_at(host.to_str().expect("utf-8"), inside.trim_matches('"'), true);
    world.builder = Some(builder);
    world.dir = Some(dir);
}

#[given("sync is blocked with errno {errno}")]
fn given_blocked_sync(world: &mut World, errno: i32) {
    world.builder = world
        .builder
        .take()
        .map(|builder| builder.block_syscall_with_errno(libc::SYS_sync, errno));
}

#[when("the sandboxee reads {path} expecting {contents}")]
fn when_reads(world: &mut World, path: String, contents: String) {
    world.run(&["read", path.trim_matches('"'), contents.trim_matches('"')]);
}

#[when("the sandboxee writes to stdout")]
fn when_writes(world: &mut World) {
    world.run(&["write"]);
}

#[when("the sandboxee calls sync")]
fn when_syncs(world: &mut World) {
    world.run(&["sync"]);
}

#[then("the sandboxee exits with status {code}")]
fn then_exits(world: &mut World, code: i32) {
    if let Some(result) = world.result() {
        assert_eq!(result.exit_code(), Some(code), "{result}");
    }
}

#[then("the run ends with a violation of {syscall}")]
fn then_violation(world: &mut World, syscall: String) {
    let Some(result) = world.result() else {
        return;
    };
    match result.violation() {
        Some(Violation::Syscall { name, .. }) => {
            assert_eq!(name.as_deref(), Some(syscall.trim_matches('"')));
        }
        other => panic!("expected a syscall violation, got {other:?}"),
    }
}

#[scenario(path = "tests/features/sandboxing.feature")]
fn sandboxing_behaviour(world: World) {
    let _ = world;
}
