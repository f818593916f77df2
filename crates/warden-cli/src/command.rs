//! Turns parsed arguments into a policy and an executor, and a sandbox
//! result into an exit status.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};
use warden_config::Config;
use warden_policy::{ExecGuard, Policy, PolicyBuilder, syscalls};
use warden_sandbox::{Executor, Limits, Monitor, Outcome, SandboxResult};

use crate::AppError;
use crate::cli::{RunArgs, Startup, SyscallGroup};

const CLI_TARGET: &str = "warden_cli";

/// Exit status when the policy was violated.
pub const EXIT_VIOLATION: u8 = 101;
/// Exit status when the wall-time limit elapsed.
pub const EXIT_TIMEOUT: u8 = 124;
/// Exit status when the sandboxee never reached `execveat`.
pub const EXIT_SETUP: u8 = 125;
/// Exit status when the sandboxee was killed on request.
pub const EXIT_KILLED: u8 = 137;
/// Added to the signal number for a sandboxee ended by a signal.
pub const EXIT_SIGNAL_BASE: u8 = 128;

/// Resolves a syscall given by name or by number.
pub(crate) fn syscall_nr(query: &str) -> Result<u32, AppError> {
    query
        .parse::<u32>()
        .ok()
        .or_else(|| syscalls::number(query))
        .ok_or_else(|| AppError::UnknownSyscall(query.to_owned()))
}

fn parse_errno(spec: &str) -> Result<(u32, i32), AppError> {
    let malformed = || AppError::MalformedErrno(spec.to_owned());
    let (name, raw) = spec.split_once('=').ok_or_else(malformed)?;
    let errno = raw.trim().parse::<i32>().map_err(|_| malformed())?;
    Ok((syscall_nr(name.trim())?, errno))
}

fn parse_env(spec: &str) -> Result<(&str, &str), AppError> {
    spec.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| AppError::MalformedEnv(spec.to_owned()))
}

fn with_startup(builder: PolicyBuilder, startup: Startup) -> PolicyBuilder {
    match startup {
        Startup::Static => builder.allow_static_startup(),
        Startup::Dynamic => builder.allow_dynamic_startup(),
        Startup::Runtime => builder.allow_runtime_startup(),
        Startup::Bare => builder,
    }
}

fn with_group(builder: PolicyBuilder, group: SyscallGroup) -> PolicyBuilder {
    match group {
        SyscallGroup::Read => builder.allow_read(),
        SyscallGroup::Write => builder.allow_write(),
        SyscallGroup::Open => builder.allow_open(),
        SyscallGroup::Mmap => builder.allow_mmap(),
        SyscallGroup::Malloc => builder.allow_system_malloc(),
        SyscallGroup::Stat => builder.allow_stat(),
        SyscallGroup::Fcntl => builder.allow_safe_fcntl(),
        SyscallGroup::Pids => builder.allow_get_pids(),
        SyscallGroup::Ids => builder.allow_get_ids(),
        SyscallGroup::Time => builder.allow_time(),
        SyscallGroup::Sleep => builder.allow_sleep(),
        SyscallGroup::Getrandom => builder.allow_getrandom(),
        SyscallGroup::Poll => builder.allow_poll(),
        SyscallGroup::Tcgets => builder.allow_tcgets(),
        SyscallGroup::Signals => builder.allow_handle_signals(),
        SyscallGroup::Rseq => builder.allow_restartable_sequences(),
        SyscallGroup::Sanitizers => builder.allow_llvm_sanitizers(),
    }
}

/// `HOST` maps to the same path inside; `HOST:INSIDE` relocates it.
fn with_mapping(builder: PolicyBuilder, spec: &str, is_ro: bool) -> PolicyBuilder {
    let (outside, inside) = spec.split_once(':').unwrap_or((spec, spec));
    if Path::new(outside).is_dir() {
        builder.add_directory_at(outside, inside, is_ro)
    } else {
        builder.add_file_at(outside, inside, is_ro)
    }
}

/// Builds the policy described by `args`.
pub(crate) fn build_policy(args: &RunArgs) -> Result<Policy, AppError> {
    let mut builder = with_startup(PolicyBuilder::new(), args.startup).allow_exit();
    builder = args.groups.iter().fold(builder, |acc, group| with_group(acc, *group));
    for name in &args.allow {
        builder = builder.allow_syscall(libc::c_long::from(syscall_nr(name)?));
    }
    for spec in &args.errno {
        let (nr, errno) = parse_errno(spec)?;
        builder = builder.block_syscall_with_errno(libc::c_long::from(nr), errno);
    }

    if args.no_namespaces {
        builder = builder.disable_namespaces();
    } else {
        builder = builder.add_mappings_for_binary(&args.binary, &args.ld_library_path);
    }
    builder = args.read_only.iter().fold(builder, |acc, spec| with_mapping(acc, spec, true));
    builder = args.writable.iter().fold(builder, |acc, spec| with_mapping(acc, spec, false));
    builder = args
        .tmpfs
        .iter()
        .fold(builder, |acc, inside| acc.add_tmpfs(inside, args.tmpfs_size));
    if let Some(hostname) = &args.hostname {
        builder = builder.set_hostname(hostname);
    }

    builder = args.allow_ipv4.iter().fold(builder, |acc, spec| acc.allow_ipv4(spec, args.port));
    builder = args.allow_ipv6.iter().fold(builder, |acc, spec| acc.allow_ipv6(spec, args.port));
    if !(args.allow_ipv4.is_empty() && args.allow_ipv6.is_empty()) {
        builder = builder.add_network_proxy_policy();
    }
    if args.unrestricted_network {
        builder = builder.allow_unrestricted_networking();
    }
    if args.allow_all {
        builder = builder.danger_default_allow_all();
    }

    Ok(builder.try_build()?)
}

/// Builds the executor described by `args`.
pub(crate) fn build_executor(args: &RunArgs) -> Result<Executor, AppError> {
    let mut executor = Executor::new(&args.binary)
        .with_args(std::iter::once(args.binary.clone()).chain(args.args.iter().cloned()));
    for spec in &args.env {
        let (key, value) = parse_env(spec)?;
        executor = executor.env(key, value);
    }
    if let Some(dir) = &args.cwd {
        executor = executor.cwd(dir.as_str());
    }
    let mut limits = Limits::new().with_wall_time(args.wall_time.map(Duration::from_secs));
    if let Some(seconds) = args.cpu_time {
        limits = limits.with_cpu_seconds(seconds);
    }
    Ok(executor.limits(limits))
}

/// Maps a finished run onto a shell exit status.
#[must_use]
pub fn exit_status(result: &SandboxResult) -> u8 {
    match result.outcome() {
        Outcome::Ok { exit_code } => u8::try_from(*exit_code).unwrap_or(u8::MAX),
        Outcome::Violation(_) => EXIT_VIOLATION,
        Outcome::Timeout => EXIT_TIMEOUT,
        Outcome::SetupError { .. } => EXIT_SETUP,
        Outcome::ExternalKill => EXIT_KILLED,
        Outcome::Signaled { signal } => u8::try_from(*signal)
            .ok()
            .and_then(|number| EXIT_SIGNAL_BASE.checked_add(number))
            .unwrap_or(u8::MAX),
    }
}

/// Runs the sandbox, or prints the compiled policy for `--dry-run`.
pub(crate) fn execute_run<W, E>(
    args: &RunArgs,
    config: &Config,
    stdout: &mut W,
    stderr: &mut E,
) -> Result<u8, AppError>
where
    W: Write,
    E: Write,
{
    let policy = build_policy(args)?;
    let executor = build_executor(args)?;
    if args.dry_run {
        describe_policy(&policy, stdout)?;
        return Ok(0);
    }

    info!(target: CLI_TARGET, binary = %args.binary, "starting sandbox");
    let result = Monitor::run(executor, &policy, config)?;
    let status = exit_status(&result);
    debug!(target: CLI_TARGET, %result, status, "sandbox finished");
    if !matches!(result.outcome(), Outcome::Ok { .. }) {
        writeln!(stderr, "warden: {result}")?;
    }
    Ok(status)
}

fn describe_policy<W: Write>(policy: &Policy, stdout: &mut W) -> Result<(), AppError> {
    let program = policy.compile(&ExecGuard::reserved())?;
    writeln!(stdout, "rules: {}", policy.rules().len())?;
    writeln!(stdout, "default action: {:?}", policy.default_action())?;
    writeln!(stdout, "filters: {}", program.filters().len())?;
    writeln!(stdout, "instructions: {}", program.len())?;
    writeln!(
        stdout,
        "namespaces: {}",
        if policy.namespaces_enabled() { "enabled" } else { "disabled" }
    )?;
    Ok(())
}

/// Prints the syscall table, or one entry.
pub(crate) fn execute_syscalls<W: Write>(
    query: Option<&str>,
    stdout: &mut W,
) -> Result<u8, AppError> {
    match query {
        None => {
            for (nr, name) in syscalls::all() {
                writeln!(stdout, "{nr}\t{name}")?;
            }
        }
        Some(wanted) => {
            let nr = syscall_nr(wanted)?;
            let name = syscalls::name(nr)
                .ok_or_else(|| AppError::UnknownSyscall(wanted.to_owned()))?;
            writeln!(stdout, "{nr}\t{name}")?;
        }
    }
    Ok(0)
}
