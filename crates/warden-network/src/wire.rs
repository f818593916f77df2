//! Native `sockaddr_in` / `sockaddr_in6` encoding.
//!
//! The layout matches the Linux structures byte for byte: family in native
//! order, port and IPv4 address in network order.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::WireError;

/// Size of `struct sockaddr_in`.
pub const SOCKADDR_IN_LEN: usize = 16;
/// Size of `struct sockaddr_in6`.
pub const SOCKADDR_IN6_LEN: usize = 28;

#[expect(clippy::host_endian_bytes, reason = "sa_family_t is host order")]
fn family_of(family: i32) -> [u8; 2] {
    u16::try_from(family).unwrap_or_default().to_ne_bytes()
}

/// Encodes `addr` as the matching native socket address structure.
#[must_use]
#[expect(
    clippy::big_endian_bytes,
    clippy::host_endian_bytes,
    reason = "ports and flow info are network order, scope ids host order"
)]
pub fn encode_sockaddr(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut buf = Vec::with_capacity(SOCKADDR_IN_LEN);
            buf.extend_from_slice(&family_of(libc::AF_INET));
            buf.extend_from_slice(&v4.port().to_be_bytes());
            buf.extend_from_slice(&v4.ip().octets());
            buf.resize(SOCKADDR_IN_LEN, 0);
            buf
        }
        SocketAddr::V6(v6) => {
            let mut buf = Vec::with_capacity(SOCKADDR_IN6_LEN);
            buf.extend_from_slice(&family_of(libc::AF_INET6));
            buf.extend_from_slice(&v6.port().to_be_bytes());
            buf.extend_from_slice(&v6.flowinfo().to_be_bytes());
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.scope_id().to_ne_bytes());
            buf
        }
    }
}

/// Decodes a native socket address structure.
///
/// # Errors
///
/// Fails when the length is neither [`SOCKADDR_IN_LEN`] nor
/// [`SOCKADDR_IN6_LEN`], or when the family does not match the length.
#[expect(
    clippy::big_endian_bytes,
    clippy::host_endian_bytes,
    reason = "ports and flow info are network order, scope ids host order"
)]
pub fn decode_sockaddr(bytes: &[u8]) -> Result<SocketAddr, WireError> {
    let len = bytes.len();
    match len {
        SOCKADDR_IN_LEN => {
            let [f0, f1, p0, p1, a0, a1, a2, a3, ..] = *bytes else {
                return Err(WireError::UnsupportedLength(len));
            };
            check_family([f0, f1], libc::AF_INET, len)?;
            let ip = Ipv4Addr::new(a0, a1, a2, a3);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be_bytes([p0, p1]))))
        }
        SOCKADDR_IN6_LEN => {
            let (head, rest) = bytes.split_at(8);
            let (octets, scope) = rest.split_at(16);
            let [f0, f1, p0, p1, w0, w1, w2, w3] = *head else {
                return Err(WireError::UnsupportedLength(len));
            };
            check_family([f0, f1], libc::AF_INET6, len)?;
            let octets: [u8; 16] = octets
                .try_into()
                .map_err(|_| WireError::UnsupportedLength(len))?;
            let scope: [u8; 4] = scope
                .try_into()
                .map_err(|_| WireError::UnsupportedLength(len))?;
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                u16::from_be_bytes([p0, p1]),
                u32::from_be_bytes([w0, w1, w2, w3]),
                u32::from_ne_bytes(scope),
            )))
        }
        _ => Err(WireError::UnsupportedLength(len)),
    }
}

#[expect(clippy::host_endian_bytes, reason = "sa_family_t is host order")]
fn check_family(raw: [u8; 2], expected: i32, len: usize) -> Result<(), WireError> {
    let family = u16::from_ne_bytes(raw);
    if i32::from(family) == expected {
        Ok(())
    } else {
        Err(WireError::FamilyMismatch { family, len })
    }
}
