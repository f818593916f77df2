//! Sandbox policies and their compilation to seccomp filters.
//!
//! A [`PolicyBuilder`] collects syscall rules, filesystem mounts and network
//! settings; [`PolicyBuilder::try_build`] validates them into an immutable
//! [`Policy`]. The executor later calls [`Policy::compile`] to obtain the
//! [`SeccompProgram`] filter stack it installs in the sandboxee just before
//! `execveat`.

pub mod bpf;
mod builder;
pub mod elf;
mod error;
mod mounts;
mod policy;
mod rule;
pub mod syscalls;

pub use bpf::SeccompProgram;
pub use builder::PolicyBuilder;
pub use error::{MountError, PolicyError};
pub use mounts::{MountEntry, Mounts};
pub use policy::{DEFAULT_HOSTNAME, ExecGuard, Policy};
pub use rule::{Action, ArgCheck, ArgCondition, ArgRule, SyscallRule};
