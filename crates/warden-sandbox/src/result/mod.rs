//! How a sandboxee run ended.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_policy::syscalls::SyscallDisplay;

#[cfg(test)]
mod tests;

/// A policy breach that ended the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Violation {
    /// The sandboxee made a syscall the policy does not allow.
    Syscall {
        /// Syscall number on the current architecture.
        nr: u32,
        /// Name from the syscall table, when known.
        name: Option<String>,
    },
    /// The sandboxee asked the network proxy for a forbidden destination.
    Network {
        /// The refused `host:port`.
        description: String,
    },
}

impl Violation {
    /// Builds a syscall violation, looking the name up in the syscall table.
    #[must_use]
    pub fn syscall(nr: u32) -> Self {
        Self::Syscall {
            nr,
            name: warden_policy::syscalls::name(nr).map(str::to_owned),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syscall { nr, .. } => write!(f, "syscall violation: {}", SyscallDisplay(*nr)),
            Self::Network { description } => {
                write!(f, "network violation: connection to {description} refused")
            }
        }
    }
}

/// Final state of a sandboxee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The sandboxee exited on its own.
    Ok {
        /// Exit status passed to `exit`.
        exit_code: i32,
    },
    /// The sandboxee never reached `execveat`.
    SetupError {
        /// What failed.
        message: String,
    },
    /// The policy was violated; the sandboxee was killed.
    Violation(Violation),
    /// A signal ended the sandboxee.
    Signaled {
        /// Signal number.
        signal: i32,
    },
    /// The wall-time limit elapsed; the sandboxee was killed.
    Timeout,
    /// The host asked for the sandboxee to be killed.
    ExternalKill,
}

/// The outcome together with the wall time the run took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxResult {
    outcome: Outcome,
    elapsed: Duration,
}

impl SandboxResult {
    /// Pairs an outcome with its duration.
    #[must_use]
    pub const fn new(outcome: Outcome, elapsed: Duration) -> Self {
        Self { outcome, elapsed }
    }

    /// How the run ended.
    #[must_use]
    pub const fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Wall time from spawn to the end of the run.
    #[must_use]
    pub const fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Returns `true` for a run that exited with status 0.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Ok { exit_code: 0 })
    }

    /// Exit status, if the sandboxee exited on its own.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            Outcome::Ok { exit_code } => Some(exit_code),
            _ => None,
        }
    }

    /// The violation that ended the run.
    #[must_use]
    pub const fn violation(&self) -> Option<&Violation> {
        match &self.outcome {
            Outcome::Violation(violation) => Some(violation),
            _ => None,
        }
    }
}

impl fmt::Display for SandboxResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Ok { exit_code } => write!(f, "exited with status {exit_code}")?,
            Outcome::SetupError { message } => write!(f, "setup failed: {message}")?,
            Outcome::Violation(violation) => write!(f, "{violation}")?,
            Outcome::Signaled { signal } => write!(f, "killed by signal {signal}")?,
            Outcome::Timeout => f.write_str("wall-time limit exceeded")?,
            Outcome::ExternalKill => f.write_str("killed on request")?,
        }
        write!(f, " after {:.3}s", self.elapsed.as_secs_f64())
    }
}
