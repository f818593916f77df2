//! Running untrusted code under a seccomp policy.
//!
//! [`Monitor`] starts an [`Executor`] in fresh namespaces with a pivoted
//! root, installs the compiled [`Policy`](warden_policy::Policy) and traces
//! the process until it ends, reporting a [`SandboxResult`]. On top of that
//! the RPC layer lets a host call functions served by a
//! [`SandboxeeClient`] through a [`Sandbox`], and [`Transaction`] adds
//! retries and time limits.

mod error;
mod executor;
mod monitor;
mod result;
mod rpc;
mod transaction;

pub use error::SandboxError;
pub use executor::{Executor, Limits, RESERVED_FDS, StdioMode};
pub use monitor::Monitor;
pub use result::{Outcome, SandboxResult, Violation};
pub use rpc::{
    Arg, CallContext, HANDSHAKE_MAGIC, RemotePtr, Request, Response, Sandbox, SandboxSpec,
    SandboxeeClient, Value,
};
pub use transaction::{BasicTransaction, Session, Transaction, TransactionBody, TransactionError};
