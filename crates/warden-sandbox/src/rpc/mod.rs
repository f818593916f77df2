//! Calling functions inside a sandboxee.
//!
//! The host's [`Sandbox`] and the sandboxee's [`SandboxeeClient`] exchange
//! [`Request`] and [`Response`] messages over comms. Bulk data follows its
//! request or response as a separate bytes record. Memory inside the
//! sandboxee is only ever named by a [`RemotePtr`].

use serde::{Deserialize, Serialize};
use warden_util::Status;

mod channel;
mod client;
mod sandbox;


pub use client::{CallContext, SandboxeeClient};
pub use sandbox::{Sandbox, SandboxSpec};

/// First value a sandboxee sends, identifying it as an RPC server.
pub const HANDSHAKE_MAGIC: u32 = 0x5741_5244;

/// A scalar, string or buffer crossing the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// No value.
    Void,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// An unsigned integer.
    UInt(u64),
    /// A UTF-8 string.
    Str(String),
    /// An inline byte buffer.
    Bytes(Vec<u8>),
    /// An address in the sandboxee. Only the sandboxee side sees these; the
    /// host works with [`RemotePtr`].
    Ptr(u64),
}

/// One argument of a host-side call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Passed by value.
    Value(Value),
    /// A region previously allocated in the same session.
    Ptr(RemotePtr),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&RemotePtr> for Arg {
    fn from(ptr: &RemotePtr) -> Self {
        Self::Ptr(ptr.clone())
    }
}

/// Handle to a region of sandboxee memory. Meaningless outside the session
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePtr {
    session: u64,
    addr: u64,
    len: u64,
}

impl RemotePtr {
    pub(crate) const fn new(session: u64, addr: u64, len: u64) -> Self {
        Self { session, addr, len }
    }

    /// Session the region belongs to.
    #[must_use]
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// Size of the region in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` for a zero-sized region.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) const fn addr(&self) -> u64 {
        self.addr
    }
}

/// Host to sandboxee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Invoke a registered function.
    Call {
        /// Registered name.
        name: String,
        /// Arguments; pointers are sandboxee addresses.
        args: Vec<Value>,
    },
    /// Allocate a zeroed region.
    Allocate {
        /// Size in bytes.
        size: u64,
    },
    /// Release a region.
    Free {
        /// Address returned by an allocation.
        addr: u64,
    },
    /// Copy the bytes record that follows into a region.
    TransferTo {
        /// Destination region.
        addr: u64,
        /// Number of bytes that follow.
        len: u64,
    },
    /// Copy a region back to the host.
    TransferFrom {
        /// Source region.
        addr: u64,
        /// Number of bytes to copy.
        len: u64,
    },
    /// Stop serving and exit.
    Exit,
}

/// Sandboxee to host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// A call returned a value.
    Value(Value),
    /// A call returned a region.
    Pointer {
        /// Address of the region.
        addr: u64,
        /// Size in bytes.
        len: u64,
    },
    /// A region was allocated.
    Allocated {
        /// Address of the region.
        addr: u64,
    },
    /// The request completed without a value.
    Done,
    /// A bytes record follows.
    Bytes,
    /// The request failed.
    Error(Status),
}
