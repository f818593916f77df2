//! Error types for host filtering and the proxy wire format.

use thiserror::Error;
use warden_util::StatusCode;

/// Errors raised while registering an allow rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllowedHostsError {
    /// The address part did not parse.
    #[error("invalid {family} address '{input}'")]
    InvalidAddress {
        /// `IPv4` or `IPv6`.
        family: &'static str,
        /// Text as supplied.
        input: String,
    },
    /// The dotted IPv4 mask did not parse or is not contiguous.
    #[error("invalid IPv4 netmask '{input}'")]
    InvalidMask {
        /// Text as supplied.
        input: String,
    },
    /// The prefix length did not parse or is out of range.
    #[error("invalid prefix length '{input}' (maximum {max})")]
    InvalidPrefix {
        /// Text as supplied.
        input: String,
        /// Largest prefix for the family.
        max: u8,
    },
}

impl AllowedHostsError {
    /// Canonical status code for the failure.
    #[must_use]
    pub const fn code(&self) -> StatusCode {
        StatusCode::InvalidArgument
    }
}

/// Errors raised while decoding a serialised socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// The buffer length matches neither `sockaddr_in` nor `sockaddr_in6`.
    #[error("unsupported socket address length {0}")]
    UnsupportedLength(usize),
    /// The family field does not match the buffer length.
    #[error("address family {family} does not match length {len}")]
    FamilyMismatch {
        /// Family found in the buffer.
        family: u16,
        /// Buffer length.
        len: usize,
    },
}

impl WireError {
    /// The errno reported back to the sandboxee.
    #[must_use]
    pub const fn errno(self) -> i32 {
        libc::EINVAL
    }
}
