//! Error types for policy construction.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use warden_network::AllowedHostsError;
use warden_util::StatusCode;

/// Errors raised while adding mounts.
#[derive(Debug, Clone, Error)]
pub enum MountError {
    /// The path was empty.
    #[error("mount path is empty")]
    EmptyPath,
    /// The path does not start at the root.
    #[error("mount path '{path}' is not absolute")]
    RelativePath {
        /// Offending path.
        path: String,
    },
    /// The path contains a NUL byte.
    #[error("mount path contains a NUL byte")]
    EmbeddedNul,
    /// The path names the root directory itself.
    #[error("cannot mount over the root directory")]
    RootPath,
    /// The destination conflicts with an earlier mount.
    #[error("cannot mount at '{path}': {reason}")]
    Conflict {
        /// Destination inside the sandbox.
        path: String,
        /// What the earlier mount is.
        reason: String,
    },
    /// A binary or library could not be inspected.
    #[error("failed to inspect '{path}': {source}")]
    Inspect {
        /// File being inspected.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: Arc<io::Error>,
    },
    /// A binary is not a well-formed ELF64 file.
    #[error("'{path}' is not a supported ELF binary: {reason}")]
    BadElf {
        /// File being inspected.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },
    /// A shared library could not be located.
    #[error("library '{library}' needed by '{needed_by}' was not found")]
    LibraryNotFound {
        /// Soname that could not be resolved.
        library: String,
        /// File that needs it.
        needed_by: PathBuf,
    },
}

impl MountError {
    /// Canonical status code for the failure.
    #[must_use]
    pub const fn code(&self) -> StatusCode {
        match self {
            Self::EmptyPath | Self::RelativePath { .. } | Self::EmbeddedNul | Self::RootPath => {
                StatusCode::InvalidArgument
            }
            Self::Conflict { .. } => StatusCode::FailedPrecondition,
            Self::Inspect { .. } | Self::LibraryNotFound { .. } => StatusCode::NotFound,
            Self::BadElf { .. } => StatusCode::InvalidArgument,
        }
    }
}

/// Errors raised while building or compiling a policy.
#[derive(Debug, Clone, Error)]
pub enum PolicyError {
    /// A mount directive failed.
    #[error(transparent)]
    Mount(#[from] MountError),
    /// An allowed-host rule failed to parse.
    #[error(transparent)]
    Hosts(#[from] AllowedHostsError),
    /// A syscall argument index was outside 0..=5.
    #[error("syscall {nr}: argument index {index} is out of range")]
    InvalidArgIndex {
        /// Syscall the rule applies to.
        nr: u32,
        /// Offending index.
        index: u8,
    },
    /// An errno value does not fit the seccomp return data.
    #[error("syscall {nr}: errno {errno} exceeds 4095")]
    InvalidErrno {
        /// Syscall the rule applies to.
        nr: u32,
        /// Offending errno.
        errno: u16,
    },
    /// Allowed hosts were registered without enabling the network proxy.
    #[error("allowed hosts require the network proxy policy")]
    HostsWithoutProxy,
    /// The network proxy and unrestricted networking were both requested.
    #[error("the network proxy cannot be combined with unrestricted networking")]
    ProxyWithUnrestrictedNetworking,
    /// Mounts were requested for a sandbox without namespaces.
    #[error("mounts require namespaces")]
    MountsWithoutNamespaces,
    /// The UTS hostname is empty, too long or contains a NUL byte.
    #[error("invalid hostname '{hostname}'")]
    InvalidHostname {
        /// Offending hostname.
        hostname: String,
    },
    /// The compiled filter exceeds the kernel limit.
    #[error("seccomp program has {len} instructions, the limit is {max}")]
    ProgramTooLong {
        /// Instruction count.
        len: usize,
        /// Kernel limit.
        max: usize,
    },
    /// The rules of one syscall expand to too many filter alternatives.
    #[error("syscall {nr}: rules expand to {count} alternatives, the limit is 256")]
    TooManyAlternatives {
        /// Syscall the rules apply to.
        nr: u32,
        /// Alternatives needed.
        count: usize,
    },
    /// `seccompiler` rejected a rule or filter.
    #[error("seccomp filter rejected: {0}")]
    Backend(String),
}

impl PolicyError {
    /// Canonical status code for the failure.
    #[must_use]
    pub const fn code(&self) -> StatusCode {
        match self {
            Self::Mount(error) => error.code(),
            Self::Hosts(error) => error.code(),
            Self::InvalidArgIndex { .. }
            | Self::InvalidErrno { .. }
            | Self::InvalidHostname { .. } => StatusCode::InvalidArgument,
            Self::HostsWithoutProxy
            | Self::ProxyWithUnrestrictedNetworking
            | Self::MountsWithoutNamespaces => StatusCode::FailedPrecondition,
            Self::ProgramTooLong { .. } | Self::TooManyAlternatives { .. } => {
                StatusCode::ResourceExhausted
            }
            Self::Backend(_) => StatusCode::Internal,
        }
    }
}
