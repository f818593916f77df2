//! Typed, length-prefixed messaging over a Unix stream socket.
//!
//! Every message is a tag-length-value record: a little-endian `u32` tag, a
//! little-endian `u32` payload length, then the payload. File descriptors
//! travel as `SCM_RIGHTS` ancillary data attached to a zero-length record.
//!
//! All traffic goes through `sendmsg(2)` and `recvmsg(2)` so a seccomp policy
//! can pin exactly those two syscalls to the channel descriptor.

mod channel;
mod error;
mod socket;
pub mod tags;

pub use channel::{Comms, Credentials};
pub use error::CommsError;

/// Descriptor number of the comms channel inside a sandboxee.
pub const SANDBOXEE_COMMS_FD: i32 = 1023;

/// Descriptor number of the network proxy channel inside a sandboxee.
pub const SANDBOXEE_NETWORK_PROXY_FD: i32 = 1022;

/// Descriptor number of the pre-opened binary the sandboxee is executed from.
pub const SANDBOXEE_EXEC_FD: i32 = 1021;

/// Largest payload accepted by default: 2 GiB minus one byte.
pub const DEFAULT_MAX_MSG_SIZE: u32 = 0x7FFF_FFFF;
