//! Allow-list of outbound destinations.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::AllowedHostsError;

#[cfg(test)]
mod tests;

/// One allow rule: a network prefix plus an optional exact port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRule {
    /// IPv4 network.
    V4 {
        /// Network address, already masked.
        network: u32,
        /// Netmask.
        mask: u32,
        /// Required destination port; `None` matches any port.
        port: Option<u16>,
    },
    /// IPv6 network.
    V6 {
        /// Network address, already masked.
        network: u128,
        /// Netmask.
        mask: u128,
        /// Required destination port; `None` matches any port.
        port: Option<u16>,
    },
}

impl HostRule {
    /// Returns `true` when `addr` falls inside this rule.
    #[must_use]
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        let port_ok = |wanted: Option<u16>| wanted.is_none_or(|port| port == addr.port());
        match (self, addr.ip()) {
            (Self::V4 { network, mask, port }, IpAddr::V4(ip)) => {
                u32::from(ip) & mask == *network && port_ok(*port)
            }
            (Self::V6 { network, mask, port }, IpAddr::V6(ip)) => {
                u128::from(ip) & mask == *network && port_ok(*port)
            }
            _ => false,
        }
    }
}

impl fmt::Display for HostRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = match self {
            Self::V4 { network, mask, port } => {
                write!(f, "{}/{}", Ipv4Addr::from(*network), mask.count_ones())?;
                port
            }
            Self::V6 { network, mask, port } => {
                write!(f, "[{}]/{}", Ipv6Addr::from(*network), mask.count_ones())?;
                port
            }
        };
        match port {
            Some(port) => write!(f, ":{port}"),
            None => f.write_str(":*"),
        }
    }
}

/// OR-combined set of [`HostRule`]s. Anything no rule matches is denied.
///
/// Rules are registered while building a policy; afterwards the set is only
/// read, so it can be shared across threads behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedHosts {
    rules: Vec<HostRule>,
}

impl AllowedHosts {
    /// Creates an empty allow-list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows an IPv4 host or network.
    ///
    /// `spec` is a bare address (`/32`), `addr/dotted.mask`, or
    /// `addr/prefix`.
    ///
    /// # Errors
    ///
    /// Fails when the address, mask or prefix does not parse.
    pub fn allow_ipv4(&mut self, spec: &str, port: Option<u16>) -> Result<(), AllowedHostsError> {
        let (host, mask) = match spec.split_once('/') {
            Some((host, bits)) => (host, parse_ipv4_mask(bits)?),
            None => (spec, u32::MAX),
        };
        let addr: Ipv4Addr = host
            .trim()
            .parse()
            .map_err(|_| AllowedHostsError::InvalidAddress {
                family: "IPv4",
                input: spec.to_owned(),
            })?;
        self.rules.push(HostRule::V4 {
            network: u32::from(addr) & mask,
            mask,
            port,
        });
        Ok(())
    }

    /// Allows an IPv6 host or network given as a bare address (`/128`) or
    /// `addr/prefix`.
    ///
    /// # Errors
    ///
    /// Fails when the address or prefix does not parse.
    pub fn allow_ipv6(&mut self, spec: &str, port: Option<u16>) -> Result<(), AllowedHostsError> {
        let (host, mask) = match spec.split_once('/') {
            Some((host, prefix)) => (host, prefix_mask_v6(parse_prefix(prefix, 128)?)),
            None => (spec, u128::MAX),
        };
        let addr: Ipv6Addr = host
            .trim()
            .parse()
            .map_err(|_| AllowedHostsError::InvalidAddress {
                family: "IPv6",
                input: spec.to_owned(),
            })?;
        self.rules.push(HostRule::V6 {
            network: u128::from(addr) & mask,
            mask,
            port,
        });
        Ok(())
    }

    /// Returns `true` when some rule admits `addr`.
    #[must_use]
    pub fn is_host_allowed(&self, addr: &SocketAddr) -> bool {
        self.rules.iter().any(|rule| rule.matches(addr))
    }

    /// Registered rules in insertion order.
    #[must_use]
    pub fn rules(&self) -> &[HostRule] {
        &self.rules
    }

    /// Number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` when nothing is allowed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn parse_prefix(text: &str, max: u8) -> Result<u8, AllowedHostsError> {
    text.trim()
        .parse::<u8>()
        .ok()
        .filter(|prefix| *prefix <= max)
        .ok_or_else(|| AllowedHostsError::InvalidPrefix {
            input: text.to_owned(),
            max,
        })
}

fn parse_ipv4_mask(text: &str) -> Result<u32, AllowedHostsError> {
    if !text.contains('.') {
        return parse_prefix(text, 32).map(prefix_mask_v4);
    }
    let mask = text
        .trim()
        .parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| AllowedHostsError::InvalidMask {
            input: text.to_owned(),
        })?;
    // Contiguous masks are a run of ones followed by zeros.
    if mask.leading_ones() + mask.trailing_zeros() != 32 {
        return Err(AllowedHostsError::InvalidMask {
            input: text.to_owned(),
        });
    }
    Ok(mask)
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn prefix_mask_v6(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}
