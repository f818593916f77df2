//! Error types for the CLI runtime.

use std::io;

use thiserror::Error;
use warden_config::ConfigError;
use warden_policy::PolicyError;
use warden_sandbox::SandboxError;

use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("unknown syscall '{0}'")]
    UnknownSyscall(String),
    #[error("expected SYSCALL=ERRNO, got '{0}'")]
    MalformedErrno(String),
    #[error("expected KEY=VALUE, got '{0}'")]
    MalformedEnv(String),
    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("sandbox failed to start: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}
