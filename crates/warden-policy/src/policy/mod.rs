//! The immutable result of [`PolicyBuilder`](crate::PolicyBuilder).

use std::os::fd::RawFd;
use std::sync::Arc;

use warden_comms::SANDBOXEE_EXEC_FD;
use warden_network::AllowedHosts;

use crate::bpf::SeccompProgram;
use crate::error::PolicyError;
use crate::mounts::Mounts;
use crate::rule::{Action, ArgCondition, SyscallRule};
use crate::syscalls;

#[cfg(test)]
mod tests;

/// Hostname a namespaced sandboxee sees unless the policy sets another.
pub const DEFAULT_HOSTNAME: &str = "warden";

const LOW_WORD: u64 = 0xffff_ffff;

/// The one `execveat` the executor performs after the filter is installed.
///
/// Its rule precedes every policy rule so that a policy cannot forbid the
/// exec that starts the sandboxee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecGuard {
    fd: RawFd,
}

impl ExecGuard {
    /// Guards an exec of the binary open at `fd`.
    #[must_use]
    pub const fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Guard for the fd the executor reserves for the binary.
    #[must_use]
    pub const fn reserved() -> Self {
        Self::new(SANDBOXEE_EXEC_FD)
    }

    /// Descriptor the binary is executed from.
    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    fn rule(self) -> SyscallRule {
        let fd = u64::from(self.fd.cast_unsigned());
        let flags = u64::from(libc::AT_EMPTY_PATH.cast_unsigned());
        SyscallRule::new(syscalls::nr(libc::SYS_execveat), Action::Allow)
            .when(ArgCondition::masked_equals(0, LOW_WORD, fd))
            .when(ArgCondition::masked_equals(4, LOW_WORD, flags))
    }
}

/// A validated sandbox policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub(crate) rules: Vec<SyscallRule>,
    pub(crate) default_action: Action,
    pub(crate) mounts: Mounts,
    pub(crate) namespaces: bool,
    pub(crate) hostname: String,
    pub(crate) allowed_hosts: Option<Arc<AllowedHosts>>,
    pub(crate) unrestricted_networking: bool,
}

impl Policy {
    /// Syscall rules in the order they were added.
    #[must_use]
    pub fn rules(&self) -> &[SyscallRule] {
        &self.rules
    }

    /// Action for syscalls no rule matches.
    #[must_use]
    pub const fn default_action(&self) -> Action {
        self.default_action
    }

    /// Filesystem view of the sandboxee.
    #[must_use]
    pub const fn mounts(&self) -> &Mounts {
        &self.mounts
    }

    /// Whether the sandboxee runs in fresh namespaces.
    #[must_use]
    pub const fn namespaces_enabled(&self) -> bool {
        self.namespaces
    }

    /// UTS hostname inside the namespaces.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Destinations the network proxy may connect to, present only when the
    /// proxy is enabled.
    #[must_use]
    pub const fn allowed_hosts(&self) -> Option<&Arc<AllowedHosts>> {
        self.allowed_hosts.as_ref()
    }

    /// Whether the monitor must run a network proxy server.
    #[must_use]
    pub const fn network_proxy_enabled(&self) -> bool {
        self.allowed_hosts.is_some()
    }

    /// Whether the sandboxee keeps the host network namespace.
    #[must_use]
    pub const fn unrestricted_networking(&self) -> bool {
        self.unrestricted_networking
    }

    /// Compiles the filter installed right before `guard`'s exec.
    ///
    /// # Errors
    ///
    /// Fails when the rules do not fit in a seccomp program.
    pub fn compile(&self, guard: &ExecGuard) -> Result<SeccompProgram, PolicyError> {
        let mut rules = Vec::with_capacity(self.rules.len() + 1);
        rules.push(guard.rule());
        rules.extend(self.rules.iter().cloned());
        SeccompProgram::compile(&rules, self.default_action)
    }
}
