//! Fluent construction of [`Policy`] values.
//!
//! Group helpers such as [`PolicyBuilder::allow_read`] add the syscalls a
//! common capability needs. Helpers that can fail (mounts, host rules) record
//! the first error and [`PolicyBuilder::try_build`] reports it, so a chain of
//! calls never has to be broken up.

use std::sync::Arc;

use tracing::debug;
use warden_comms::SANDBOXEE_NETWORK_PROXY_FD;
use warden_network::AllowedHosts;

use crate::error::PolicyError;
use crate::mounts::Mounts;
use crate::policy::{DEFAULT_HOSTNAME, ExecGuard, Policy};
use crate::rule::{Action, ArgCondition, ArgRule, SyscallRule};
use crate::syscalls;

#[cfg(test)]
mod tests;

const BUILDER_TARGET: &str = "warden_policy::builder";

/// `HOST_NAME_MAX` on Linux.
const MAX_HOSTNAME_LEN: usize = 64;

/// Low 32 bits, for `int` arguments whose upper half is unspecified.
const INT_MASK: u64 = 0xffff_ffff;

/// `ioctl` request reading terminal attributes, shared by x86_64 and
/// aarch64.
const TCGETS: u64 = 0x5401;

/// `FUTEX_PRIVATE_FLAG | FUTEX_CLOCK_REALTIME`.
const FUTEX_MODIFIERS: u64 = 0x180;

/// `arch_prctl` code used by static startup to set the TLS base.
#[cfg(target_arch = "x86_64")]
const ARCH_SET_FS: u64 = 0x1002;

/// `EINVAL`, returned for every other `arch_prctl` code.
#[cfg(target_arch = "x86_64")]
const ARCH_PRCTL_FALLBACK_ERRNO: u16 = 22;

/// Builds a [`Policy`].
///
/// The default action is a reported violation; everything the sandboxee
/// needs must be allowed explicitly.
///
/// ```
/// use warden_policy::PolicyBuilder;
///
/// let policy = PolicyBuilder::new()
///     .allow_read()
///     .allow_write()
///     .allow_exit()
///     .try_build()
///     .expect("valid policy");
/// assert!(policy.namespaces_enabled());
/// ```
#[derive(Debug)]
pub struct PolicyBuilder {
    rules: Vec<SyscallRule>,
    default_action: Action,
    mounts: Mounts,
    namespaces: bool,
    hostname: String,
    hosts: AllowedHosts,
    network_proxy: bool,
    unrestricted_networking: bool,
    error: Option<PolicyError>,
}

impl Default for PolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyBuilder {
    /// Starts from a deny-everything policy with namespaces enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_action: Action::Violation,
            mounts: Mounts::new(),
            namespaces: true,
            hostname: DEFAULT_HOSTNAME.to_owned(),
            hosts: AllowedHosts::new(),
            network_proxy: false,
            unrestricted_networking: false,
            error: None,
        }
    }

    // ---------------------------------------------------------------------
    // Raw rules
    // ---------------------------------------------------------------------

    /// Allows syscall `nr` unconditionally.
    #[must_use]
    pub fn allow_syscall(mut self, nr: libc::c_long) -> Self {
        self.rules
            .push(SyscallRule::new(syscalls::nr(nr), Action::Allow));
        self
    }

    /// Allows each syscall in `nrs` unconditionally.
    #[must_use]
    pub fn allow_syscalls(self, nrs: &[libc::c_long]) -> Self {
        nrs.iter().fold(self, |builder, &nr| builder.allow_syscall(nr))
    }

    /// Allows syscall `nr` when its first argument is `fd`.
    #[must_use]
    pub fn allow_syscall_on_fd(self, nr: libc::c_long, fd: i32) -> Self {
        let arg = u64::from(fd.cast_unsigned());
        self.add_policy_on_syscall(
            nr,
            vec![ArgRule::new(Action::Allow).when(ArgCondition::masked_equals(0, INT_MASK, arg))],
        )
    }

    /// Adds argument-dependent rules for `nr`, tried in order.
    #[must_use]
    pub fn add_policy_on_syscall(mut self, nr: libc::c_long, rules: Vec<ArgRule>) -> Self {
        let number = syscalls::nr(nr);
        self.rules
            .extend(rules.into_iter().map(|rule| rule.into_syscall_rule(number)));
        self
    }

    /// Makes `nr` fail with `errno` without running it.
    #[must_use]
    pub fn block_syscall_with_errno(mut self, nr: libc::c_long, errno: i32) -> Self {
        let code = u16::try_from(errno).unwrap_or(u16::MAX);
        self.rules
            .push(SyscallRule::new(syscalls::nr(nr), Action::Errno(code)));
        self
    }

    /// Makes each syscall in `nrs` fail with `errno`.
    #[must_use]
    pub fn block_syscalls_with_errno(self, nrs: &[libc::c_long], errno: i32) -> Self {
        nrs.iter()
            .fold(self, |builder, &nr| builder.block_syscall_with_errno(nr, errno))
    }

    // ---------------------------------------------------------------------
    // Syscall groups
    // ---------------------------------------------------------------------

    /// Reads from already open descriptors.
    #[must_use]
    pub fn allow_read(self) -> Self {
        self.allow_syscalls(&[
            libc::SYS_read,
            libc::SYS_readv,
            libc::SYS_pread64,
            libc::SYS_preadv,
        ])
    }

    /// Writes to already open descriptors.
    #[must_use]
    pub fn allow_write(self) -> Self {
        self.allow_syscalls(&[
            libc::SYS_write,
            libc::SYS_writev,
            libc::SYS_pwrite64,
            libc::SYS_pwritev,
        ])
    }

    /// Opens files; what can be opened is bounded by the mounts.
    #[must_use]
    pub fn allow_open(self) -> Self {
        #[cfg(target_arch = "x86_64")]
        let builder = self.allow_syscalls(&[libc::SYS_open, libc::SYS_creat]);
        #[cfg(not(target_arch = "x86_64"))]
        let builder = self;
        builder.allow_syscall(libc::SYS_openat)
    }

    /// Terminates the process or a thread.
    #[must_use]
    pub fn allow_exit(self) -> Self {
        self.allow_syscalls(&[libc::SYS_exit, libc::SYS_exit_group])
    }

    /// Maps memory.
    #[must_use]
    pub fn allow_mmap(self) -> Self {
        self.allow_syscall(libc::SYS_mmap)
    }

    /// The system allocator: `brk` plus anonymous mappings.
    #[must_use]
    pub fn allow_system_malloc(self) -> Self {
        self.allow_mmap()
            .allow_syscalls(&[libc::SYS_brk, libc::SYS_munmap, libc::SYS_mremap])
    }

    /// Startup of a statically linked binary.
    #[must_use]
    pub fn allow_static_startup(self) -> Self {
        #[cfg(target_arch = "x86_64")]
        let builder = self.add_policy_on_syscall(
            libc::SYS_arch_prctl,
            vec![
                ArgRule::new(Action::Allow).when(ArgCondition::equals(0, ARCH_SET_FS)),
                ArgRule::new(Action::Errno(ARCH_PRCTL_FALLBACK_ERRNO)),
            ],
        );
        #[cfg(not(target_arch = "x86_64"))]
        let builder = self;
        builder.allow_syscalls(&[
            libc::SYS_brk,
            libc::SYS_uname,
            libc::SYS_set_tid_address,
            libc::SYS_set_robust_list,
            libc::SYS_prlimit64,
            libc::SYS_getrlimit,
        ])
    }

    /// Startup of a dynamically linked binary: the loader opens, maps and
    /// protects its libraries.
    #[must_use]
    pub fn allow_dynamic_startup(self) -> Self {
        #[cfg(target_arch = "x86_64")]
        let builder = self.allow_syscalls(&[libc::SYS_access, libc::SYS_readlink]);
        #[cfg(not(target_arch = "x86_64"))]
        let builder = self;
        builder
            .allow_static_startup()
            .allow_read()
            .allow_stat()
            .allow_open()
            .allow_mmap()
            .allow_syscalls(&[
                libc::SYS_close,
                libc::SYS_lseek,
                libc::SYS_mprotect,
                libc::SYS_munmap,
                libc::SYS_faccessat,
                libc::SYS_readlinkat,
            ])
    }

    /// What the Rust standard library does before `main`: dynamic startup,
    /// the stdio `poll` check, the main thread's signal stack and guard page
    /// discovery.
    #[must_use]
    pub fn allow_runtime_startup(self) -> Self {
        self.allow_dynamic_startup()
            .allow_poll()
            .allow_getrandom()
            .allow_restartable_sequences()
            .allow_futex_op(libc::FUTEX_WAIT)
            .allow_futex_op(libc::FUTEX_WAKE)
            .allow_syscalls(&[
                libc::SYS_rt_sigaction,
                libc::SYS_rt_sigprocmask,
                libc::SYS_sigaltstack,
                libc::SYS_madvise,
                libc::SYS_gettid,
                libc::SYS_sched_getaffinity,
            ])
    }

    /// Process and thread identifiers.
    #[must_use]
    pub fn allow_get_pids(self) -> Self {
        self.allow_syscalls(&[libc::SYS_getpid, libc::SYS_getppid, libc::SYS_gettid])
    }

    /// User and group identifiers.
    #[must_use]
    pub fn allow_get_ids(self) -> Self {
        self.allow_syscalls(&[
            libc::SYS_getuid,
            libc::SYS_geteuid,
            libc::SYS_getresuid,
            libc::SYS_getgid,
            libc::SYS_getegid,
            libc::SYS_getresgid,
            libc::SYS_getgroups,
        ])
    }

    /// File status queries.
    #[must_use]
    pub fn allow_stat(self) -> Self {
        #[cfg(target_arch = "x86_64")]
        let builder = self.allow_syscalls(&[libc::SYS_stat, libc::SYS_lstat]);
        #[cfg(not(target_arch = "x86_64"))]
        let builder = self;
        builder.allow_syscalls(&[
            libc::SYS_fstat,
            libc::SYS_newfstatat,
            libc::SYS_statx,
            libc::SYS_fstatfs,
            libc::SYS_statfs,
        ])
    }

    /// `fcntl` commands that inspect or adjust descriptors without
    /// acquiring new capabilities.
    #[must_use]
    pub fn allow_safe_fcntl(self) -> Self {
        let commands = [
            libc::F_GETFD,
            libc::F_SETFD,
            libc::F_GETFL,
            libc::F_SETFL,
            libc::F_GETLK,
            libc::F_SETLK,
            libc::F_SETLKW,
            libc::F_DUPFD,
            libc::F_DUPFD_CLOEXEC,
        ];
        let rules = commands
            .iter()
            .map(|command| {
                ArgRule::new(Action::Allow).when(ArgCondition::masked_equals(
                    1,
                    INT_MASK,
                    u64::from(command.cast_unsigned()),
                ))
            })
            .collect();
        self.add_policy_on_syscall(libc::SYS_fcntl, rules)
    }

    /// One `futex` operation, with or without the private and realtime
    /// modifiers.
    #[must_use]
    pub fn allow_futex_op(self, op: i32) -> Self {
        let mask = INT_MASK & !FUTEX_MODIFIERS;
        self.add_policy_on_syscall(
            libc::SYS_futex,
            vec![ArgRule::new(Action::Allow).when(ArgCondition::masked_equals(
                1,
                mask,
                u64::from(op.cast_unsigned()),
            ))],
        )
    }

    /// What sanitizer runtimes do at startup and when writing a report.
    #[must_use]
    pub fn allow_llvm_sanitizers(self) -> Self {
        self.allow_syscalls(&[
            libc::SYS_madvise,
            libc::SYS_sigaltstack,
            libc::SYS_sched_getaffinity,
            libc::SYS_munmap,
            libc::SYS_getpid,
        ])
    }

    /// Installing handlers and returning from them.
    #[must_use]
    pub fn allow_handle_signals(self) -> Self {
        #[cfg(target_arch = "x86_64")]
        let builder = self.allow_syscall(libc::SYS_alarm);
        #[cfg(not(target_arch = "x86_64"))]
        let builder = self;
        builder.allow_syscalls(&[
            libc::SYS_rt_sigaction,
            libc::SYS_rt_sigreturn,
            libc::SYS_rt_sigprocmask,
            libc::SYS_sigaltstack,
        ])
    }

    /// Clocks.
    #[must_use]
    pub fn allow_time(self) -> Self {
        #[cfg(target_arch = "x86_64")]
        let builder = self.allow_syscall(libc::SYS_time);
        #[cfg(not(target_arch = "x86_64"))]
        let builder = self;
        builder.allow_syscalls(&[
            libc::SYS_clock_gettime,
            libc::SYS_clock_getres,
            libc::SYS_gettimeofday,
        ])
    }

    /// Sleeping.
    #[must_use]
    pub fn allow_sleep(self) -> Self {
        self.allow_syscalls(&[libc::SYS_nanosleep, libc::SYS_clock_nanosleep])
    }

    /// Kernel randomness.
    #[must_use]
    pub fn allow_getrandom(self) -> Self {
        self.allow_syscall(libc::SYS_getrandom)
    }

    /// Waiting on descriptors.
    #[must_use]
    pub fn allow_poll(self) -> Self {
        #[cfg(target_arch = "x86_64")]
        let builder = self.allow_syscall(libc::SYS_poll);
        #[cfg(not(target_arch = "x86_64"))]
        let builder = self;
        builder.allow_syscall(libc::SYS_ppoll)
    }

    /// `ioctl(fd, TCGETS, ...)`, which `isatty` uses.
    #[must_use]
    pub fn allow_tcgets(self) -> Self {
        self.add_policy_on_syscall(
            libc::SYS_ioctl,
            vec![
                ArgRule::new(Action::Allow)
                    .when(ArgCondition::masked_equals(1, INT_MASK, TCGETS)),
            ],
        )
    }

    /// Restartable sequences, which recent C libraries register per thread.
    #[must_use]
    pub fn allow_restartable_sequences(self) -> Self {
        self.allow_syscalls(&[libc::SYS_rseq, libc::SYS_getcpu, libc::SYS_membarrier])
    }

    // ---------------------------------------------------------------------
    // Isolation
    // ---------------------------------------------------------------------

    /// Runs the sandboxee in the host namespaces. Mounts are then rejected.
    #[must_use]
    pub const fn disable_namespaces(mut self) -> Self {
        self.namespaces = false;
        self
    }

    /// Returns `false` once [`PolicyBuilder::disable_namespaces`] was called.
    #[must_use]
    pub const fn namespaces_enabled(&self) -> bool {
        self.namespaces
    }

    /// Keeps the host network namespace.
    #[must_use]
    pub const fn allow_unrestricted_networking(mut self) -> Self {
        self.unrestricted_networking = true;
        self
    }

    /// Allows every syscall no rule decides. For debugging policies only.
    #[must_use]
    pub const fn danger_default_allow_all(mut self) -> Self {
        self.default_action = Action::Allow;
        self
    }

    /// Sets the UTS hostname seen inside the namespaces.
    #[must_use]
    pub fn set_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_owned();
        self
    }

    // ---------------------------------------------------------------------
    // Mounts
    // ---------------------------------------------------------------------

    /// See [`Mounts::add_file`].
    #[must_use]
    pub fn add_file(mut self, path: &str) -> Self {
        let result = self.mounts.add_file(path);
        self.record(result)
    }

    /// See [`Mounts::add_file_at`].
    #[must_use]
    pub fn add_file_at(mut self, outside: &str, inside: &str, is_ro: bool) -> Self {
        let result = self.mounts.add_file_at(outside, inside, is_ro);
        self.record(result)
    }

    /// See [`Mounts::add_directory`].
    #[must_use]
    pub fn add_directory(mut self, path: &str) -> Self {
        let result = self.mounts.add_directory(path);
        self.record(result)
    }

    /// See [`Mounts::add_directory_at`].
    #[must_use]
    pub fn add_directory_at(mut self, outside: &str, inside: &str, is_ro: bool) -> Self {
        let result = self.mounts.add_directory_at(outside, inside, is_ro);
        self.record(result)
    }

    /// See [`Mounts::add_tmpfs`].
    #[must_use]
    pub fn add_tmpfs(mut self, inside: &str, size: u64) -> Self {
        let result = self.mounts.add_tmpfs(inside, size);
        self.record(result)
    }

    /// See [`Mounts::add_mappings_for_binary`].
    #[must_use]
    pub fn add_mappings_for_binary(mut self, binary: &str, ld_library_path: &str) -> Self {
        let result = self.mounts.add_mappings_for_binary(binary, ld_library_path);
        self.record(result)
    }

    // ---------------------------------------------------------------------
    // Network
    // ---------------------------------------------------------------------

    /// Lets the network proxy connect to IPv4 hosts matching `spec`.
    #[must_use]
    pub fn allow_ipv4(mut self, spec: &str, port: Option<u16>) -> Self {
        let result = self.hosts.allow_ipv4(spec, port);
        self.record(result)
    }

    /// Lets the network proxy connect to IPv6 hosts matching `spec`.
    #[must_use]
    pub fn allow_ipv6(mut self, spec: &str, port: Option<u16>) -> Self {
        let result = self.hosts.allow_ipv6(spec, port);
        self.record(result)
    }

    /// Enables the network proxy and lets the sandboxee talk to it over the
    /// reserved descriptor.
    #[must_use]
    pub fn add_network_proxy_policy(mut self) -> Self {
        self.network_proxy = true;
        self.allow_syscall_on_fd(libc::SYS_sendmsg, SANDBOXEE_NETWORK_PROXY_FD)
            .allow_syscall_on_fd(libc::SYS_recvmsg, SANDBOXEE_NETWORK_PROXY_FD)
    }

    // ---------------------------------------------------------------------
    // Building
    // ---------------------------------------------------------------------

    /// Validates the collected settings.
    ///
    /// # Errors
    ///
    /// Returns the first recorded mount or host error, or a
    /// [`PolicyError`] describing inconsistent settings or rules that do not
    /// compile.
    pub fn try_build(self) -> Result<Policy, PolicyError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if !self.hosts.is_empty() && !self.network_proxy {
            return Err(PolicyError::HostsWithoutProxy);
        }
        if self.network_proxy && self.unrestricted_networking {
            return Err(PolicyError::ProxyWithUnrestrictedNetworking);
        }
        if !self.namespaces && !self.mounts.is_empty() {
            return Err(PolicyError::MountsWithoutNamespaces);
        }
        if self.hostname.is_empty()
            || self.hostname.len() > MAX_HOSTNAME_LEN
            || self.hostname.contains('\0')
        {
            return Err(PolicyError::InvalidHostname {
                hostname: self.hostname,
            });
        }

        let policy = Policy {
            rules: self.rules,
            default_action: self.default_action,
            mounts: self.mounts,
            namespaces: self.namespaces,
            hostname: self.hostname,
            allowed_hosts: self.network_proxy.then(|| Arc::new(self.hosts)),
            unrestricted_networking: self.unrestricted_networking,
        };
        let program = policy.compile(&ExecGuard::reserved())?;
        debug!(
            target: BUILDER_TARGET,
            rules = policy.rules.len(),
            filters = program.filters().len(),
            instructions = program.len(),
            mounts = policy.mounts.len(),
            network_proxy = policy.network_proxy_enabled(),
            "policy built"
        );
        Ok(policy)
    }

    /// Like [`PolicyBuilder::try_build`] for policies fixed at development
    /// time.
    ///
    /// # Panics
    ///
    /// Panics when the policy is invalid.
    #[must_use]
    pub fn build_or_die(self) -> Policy {
        match self.try_build() {
            Ok(policy) => policy,
            Err(error) => panic!("invalid sandbox policy: {error}"),
        }
    }

    fn record<E: Into<PolicyError>>(mut self, result: Result<(), E>) -> Self {
        if let Err(raw) = result {
            let error = raw.into();
            debug!(target: BUILDER_TARGET, %error, "policy builder error recorded");
            if self.error.is_none() {
                self.error = Some(error);
            }
        }
        self
    }
}
