//! Sandboxee binaries and helpers for the end-to-end tests.
//!
//! The crate builds two sandboxees:
//!
//! - `testee_basic` performs one action named by its first argument, e.g.
//!   `exit 7`, `write` or `read /data/in.txt payload`.
//! - `testee_rpc` serves RPC functions for [`warden_sandbox::Sandbox`].
//!
//! # Graceful Skipping
//!
//! Sandboxing needs `ptrace` and seccomp, and the namespaced tests need
//! unprivileged user namespaces. Containers often forbid both, so the tests
//! check the host once through [`capabilities`] and skip when a requirement
//! is missing.

use once_cell::sync::Lazy;
use tracing::info;
use warden_config::Config;
use warden_policy::PolicyBuilder;
use warden_sandbox::{Executor, Monitor};

const TESTCASES_TARGET: &str = "warden_testcases";

/// Binary run by the host checks.
pub const HOST_CHECK_BINARY: &str = "/bin/true";

/// Exit status of `testee_basic` for a malformed command line.
pub const EXIT_USAGE: u8 = 64;

/// Exit status of `testee_basic read` when the contents differ.
pub const EXIT_MISMATCH: u8 = 65;

/// Exit status of `testee_basic` when an OS call failed unexpectedly.
pub const EXIT_FAILED: u8 = 66;

/// What the host kernel lets a monitor do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// A traced, seccomp-filtered child runs to completion.
    pub tracing: bool,
    /// The same child also runs inside fresh namespaces.
    pub namespaces: bool,
}

static CAPABILITIES: Lazy<Capabilities> = Lazy::new(detect);

/// Checks the host on first use and caches the answer.
#[must_use]
pub fn capabilities() -> Capabilities {
    *CAPABILITIES
}

fn detect() -> Capabilities {
    let tracing = check_host("tracing", PolicyBuilder::new().disable_namespaces());
    let namespaces = tracing
        && check_host(
            "namespaces",
            PolicyBuilder::new().add_mappings_for_binary(HOST_CHECK_BINARY, ""),
        );
    Capabilities {
        tracing,
        namespaces,
    }
}

fn check_host(feature: &str, builder: PolicyBuilder) -> bool {
    let policy = match builder.danger_default_allow_all().try_build() {
        Ok(policy) => policy,
        Err(error) => {
            info!(target: TESTCASES_TARGET, feature, %error, "host check policy rejected");
            return false;
        }
    };
    match Monitor::run(Executor::new(HOST_CHECK_BINARY), &policy, &Config::default()) {
        Ok(result) if result.is_success() => true,
        Ok(result) => {
            info!(target: TESTCASES_TARGET, feature, %result, "host check did not succeed");
            false
        }
        Err(error) => {
            info!(target: TESTCASES_TARGET, feature, %error, "host check failed to start");
            false
        }
    }
}

/// What every Rust sandboxee needs: runtime startup, the allocator and exit.
#[must_use]
pub fn rust_runtime_policy() -> PolicyBuilder {
    PolicyBuilder::new()
        .allow_runtime_startup()
        .allow_system_malloc()
        .allow_exit()
}

/// Returns early from a test when the host cannot trace children.
#[macro_export]
macro_rules! require_tracing {
    () => {
        if !$crate::capabilities().tracing {
            eprintln!("Skipping test: ptrace or seccomp is unavailable");
            return;
        }
    };
}

/// Returns early from a test when the host cannot create user namespaces.
#[macro_export]
macro_rules! require_namespaces {
    () => {
        if !$crate::capabilities().namespaces {
            eprintln!("Skipping test: unprivileged user namespaces are unavailable");
            return;
        }
    };
}
