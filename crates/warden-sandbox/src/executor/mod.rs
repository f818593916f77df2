//! Description of the process to start inside the sandbox.
//!
//! An [`Executor`] only records what to run; [`Monitor::spawn`] turns it and
//! a [`Policy`] into a running sandboxee.
//!
//! [`Monitor::spawn`]: crate::Monitor::spawn
//! [`Policy`]: warden_policy::Policy

use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use warden_comms::{SANDBOXEE_COMMS_FD, SANDBOXEE_EXEC_FD, SANDBOXEE_NETWORK_PROXY_FD};

use crate::error::SandboxError;

pub(crate) mod child;
pub(crate) mod plan;

#[cfg(test)]
mod tests;

/// Descriptors the executor assigns itself inside the sandboxee.
pub const RESERVED_FDS: [RawFd; 3] = [
    SANDBOXEE_EXEC_FD,
    SANDBOXEE_NETWORK_PROXY_FD,
    SANDBOXEE_COMMS_FD,
];

/// Where a standard stream of the sandboxee points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioMode {
    /// Share the host process's stream.
    #[default]
    Inherit,
    /// Connect the stream to `/dev/null`.
    Null,
}

/// Resource limits applied to the sandboxee. Unset limits are inherited.
///
/// Core dumps are always disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    address_space: Option<u64>,
    file_size: Option<u64>,
    open_files: Option<u64>,
    cpu_seconds: Option<u64>,
    wall_time: Option<Duration>,
}

impl Limits {
    /// No limits besides disabled core dumps.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            address_space: None,
            file_size: None,
            open_files: None,
            cpu_seconds: None,
            wall_time: None,
        }
    }

    /// Caps `RLIMIT_AS` at `bytes`.
    #[must_use]
    pub const fn with_address_space(mut self, bytes: u64) -> Self {
        self.address_space = Some(bytes);
        self
    }

    /// Caps `RLIMIT_FSIZE` at `bytes`.
    #[must_use]
    pub const fn with_file_size(mut self, bytes: u64) -> Self {
        self.file_size = Some(bytes);
        self
    }

    /// Caps `RLIMIT_NOFILE` at `count`.
    #[must_use]
    pub const fn with_open_files(mut self, count: u64) -> Self {
        self.open_files = Some(count);
        self
    }

    /// Caps `RLIMIT_CPU` at `seconds`.
    #[must_use]
    pub const fn with_cpu_seconds(mut self, seconds: u64) -> Self {
        self.cpu_seconds = Some(seconds);
        self
    }

    /// Kills the sandboxee once `limit` of wall time has passed. A zero
    /// duration means no limit.
    #[must_use]
    pub const fn with_wall_time(mut self, limit: Option<Duration>) -> Self {
        self.wall_time = match limit {
            Some(limit) if limit.is_zero() => None,
            other => other,
        };
        self
    }

    /// `RLIMIT_AS` in bytes.
    #[must_use]
    pub const fn address_space(&self) -> Option<u64> {
        self.address_space
    }

    /// `RLIMIT_FSIZE` in bytes.
    #[must_use]
    pub const fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    /// `RLIMIT_NOFILE`.
    #[must_use]
    pub const fn open_files(&self) -> Option<u64> {
        self.open_files
    }

    /// `RLIMIT_CPU` in seconds.
    #[must_use]
    pub const fn cpu_seconds(&self) -> Option<u64> {
        self.cpu_seconds
    }

    /// Wall-time limit.
    #[must_use]
    pub const fn wall_time(&self) -> Option<Duration> {
        self.wall_time
    }
}

/// The binary, arguments, environment and descriptors of a sandboxee.
///
/// The environment starts empty. `argv[0]` defaults to the binary path.
#[derive(Debug)]
pub struct Executor {
    path: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<String>,
    stdin: StdioMode,
    stdout: StdioMode,
    stderr: StdioMode,
    fd_map: Vec<(OwnedFd, RawFd)>,
    limits: Limits,
}

impl Executor {
    /// Describes a run of the binary at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let binary: PathBuf = path.into();
        let argv0 = binary.to_string_lossy().into_owned();
        Self {
            path: binary,
            args: vec![argv0],
            env: Vec::new(),
            cwd: None,
            stdin: StdioMode::default(),
            stdout: StdioMode::default(),
            stderr: StdioMode::default(),
            fd_map: Vec::new(),
            limits: Limits::new(),
        }
    }

    /// Replaces the whole argument vector, `argv[0]` included.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable, replacing an earlier value.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let name = key.into();
        let setting = value.into();
        match self.env.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = setting,
            None => self.env.push((name, setting)),
        }
        self
    }

    /// Working directory inside the sandbox.
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Where standard input comes from.
    #[must_use]
    pub const fn stdin(mut self, mode: StdioMode) -> Self {
        self.stdin = mode;
        self
    }

    /// Where standard output goes.
    #[must_use]
    pub const fn stdout(mut self, mode: StdioMode) -> Self {
        self.stdout = mode;
        self
    }

    /// Where standard error goes.
    #[must_use]
    pub const fn stderr(mut self, mode: StdioMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Makes `fd` available as `target` inside the sandboxee.
    #[must_use]
    pub fn map_fd(mut self, fd: OwnedFd, target: RawFd) -> Self {
        self.fd_map.push((fd, target));
        self
    }

    /// Resource limits.
    #[must_use]
    pub const fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Host path of the binary.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Argument vector.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment as `(key, value)` pairs.
    #[must_use]
    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    /// Configured limits.
    #[must_use]
    pub const fn resource_limits(&self) -> &Limits {
        &self.limits
    }

    /// Rejects descriptions no sandboxee could be started from.
    pub(crate) fn validate(&self) -> Result<(), SandboxError> {
        let invalid = |reason: String| Err(SandboxError::InvalidExecutor { reason });
        if !self.path.is_absolute() {
            return invalid(format!("{} is not an absolute path", self.path.display()));
        }
        if self.args.is_empty() {
            return invalid(String::from("the argument vector is empty"));
        }
        if let Some(cwd) = &self.cwd
            && !warden_util::path::is_absolute(cwd)
        {
            return invalid(format!("working directory {cwd} is not absolute"));
        }
        if self.env.iter().any(|(key, _)| key.is_empty() || key.contains('=')) {
            return invalid(String::from("environment keys must be non-empty and free of '='"));
        }
        let mut targets: Vec<RawFd> = Vec::new();
        for &(_, target) in &self.fd_map {
            if target < 0 || RESERVED_FDS.contains(&target) || targets.contains(&target) {
                return invalid(format!("descriptor {target} cannot be mapped"));
            }
            targets.push(target);
        }
        Ok(())
    }
}
