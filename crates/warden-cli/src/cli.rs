//! Command-line argument definitions for the `warden` binary.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Default size of a `--tmpfs` mount in bytes.
pub(crate) const DEFAULT_TMPFS_SIZE: u64 = 64 << 20;

/// Runs programs under a seccomp policy inside fresh namespaces.
#[derive(Parser, Debug)]
#[command(name = "warden", disable_help_subcommand = true, version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Runs BINARY in a sandbox and exits with its status.
    Run(RunArgs),
    /// Prints the syscall table, or looks up one syscall by name or number.
    Syscalls {
        /// Name (`openat`) or number (`257`) to look up.
        #[arg(value_name = "SYSCALL")]
        query: Option<String>,
    },
}

/// Startup syscalls the sandboxee is expected to make before `main`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum Startup {
    /// A statically linked binary.
    #[default]
    Static,
    /// A dynamically linked binary.
    Dynamic,
    /// A binary whose language runtime also polls and handles signals.
    Runtime,
    /// Nothing beyond the explicitly allowed syscalls.
    #[value(name = "none")]
    Bare,
}

/// Named groups of related syscalls.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum SyscallGroup {
    Read,
    Write,
    Open,
    Mmap,
    Malloc,
    Stat,
    Fcntl,
    Pids,
    Ids,
    Time,
    Sleep,
    Getrandom,
    Poll,
    Tcgets,
    Signals,
    Rseq,
    Sanitizers,
}

#[derive(Args, Debug)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "each flag is an independent command-line switch"
)]
pub(crate) struct RunArgs {
    /// Allows a syscall by name.
    #[arg(long = "allow", value_name = "SYSCALL")]
    pub(crate) allow: Vec<String>,
    /// Allows a group of related syscalls.
    #[arg(long = "allow-group", value_enum, value_name = "GROUP")]
    pub(crate) groups: Vec<SyscallGroup>,
    /// Fails a syscall with an errno instead of running it.
    #[arg(long = "errno", value_name = "SYSCALL=ERRNO")]
    pub(crate) errno: Vec<String>,
    /// Startup syscalls to allow.
    #[arg(long, value_enum, default_value_t = Startup::Static)]
    pub(crate) startup: Startup,
    /// Allows every syscall the policy does not mention. Unsafe.
    #[arg(long)]
    pub(crate) allow_all: bool,
    /// Runs without user, mount, network and other namespaces.
    #[arg(long)]
    pub(crate) no_namespaces: bool,
    /// Maps a host path read-only, as `HOST` or `HOST:INSIDE`.
    #[arg(long = "ro", value_name = "PATH")]
    pub(crate) read_only: Vec<String>,
    /// Maps a host path writable, as `HOST` or `HOST:INSIDE`.
    #[arg(long = "rw", value_name = "PATH")]
    pub(crate) writable: Vec<String>,
    /// Mounts an empty tmpfs at PATH inside the sandbox.
    #[arg(long = "tmpfs", value_name = "PATH")]
    pub(crate) tmpfs: Vec<String>,
    /// Size of each tmpfs mount in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_TMPFS_SIZE)]
    pub(crate) tmpfs_size: u64,
    /// Library search path used when mapping the binary's dependencies.
    #[arg(long, value_name = "DIRS", default_value = "")]
    pub(crate) ld_library_path: String,
    /// Hostname inside the UTS namespace.
    #[arg(long)]
    pub(crate) hostname: Option<String>,
    /// Lets the sandboxee connect to addresses in an IPv4 range.
    #[arg(long = "allow-ipv4", value_name = "CIDR")]
    pub(crate) allow_ipv4: Vec<String>,
    /// Lets the sandboxee connect to addresses in an IPv6 range.
    #[arg(long = "allow-ipv6", value_name = "CIDR")]
    pub(crate) allow_ipv6: Vec<String>,
    /// Restricts `--allow-ipv4` and `--allow-ipv6` ranges to one port.
    #[arg(long, value_name = "PORT")]
    pub(crate) port: Option<u16>,
    /// Keeps the host network namespace.
    #[arg(long)]
    pub(crate) unrestricted_network: bool,
    /// Kills the sandboxee after this many seconds of wall time.
    #[arg(long, value_name = "SECS")]
    pub(crate) wall_time: Option<u64>,
    /// Limits the sandboxee to this many seconds of CPU time.
    #[arg(long, value_name = "SECS")]
    pub(crate) cpu_time: Option<u64>,
    /// Working directory inside the sandbox.
    #[arg(long, value_name = "DIR")]
    pub(crate) cwd: Option<String>,
    /// Sets an environment variable for the sandboxee.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub(crate) env: Vec<String>,
    /// Prints the compiled policy instead of running the binary.
    #[arg(long)]
    pub(crate) dry_run: bool,
    /// Absolute path of the program to run.
    #[arg(value_name = "BINARY")]
    pub(crate) binary: String,
    /// Arguments passed to BINARY.
    #[arg(
        value_name = "ARG",
        num_args = 0..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub(crate) args: Vec<String>,
}
