//! Outbound network mediation for sandboxees.
//!
//! A sandboxee confined to an empty network namespace cannot open sockets of
//! its own. Instead it asks the [`NetworkProxyServer`] running in the host
//! process to connect on its behalf; the server checks each destination
//! against [`AllowedHosts`] and hands back a connected descriptor.

mod allowed_hosts;
mod client;
mod error;
mod server;
pub mod wire;

pub use allowed_hosts::{AllowedHosts, HostRule};
pub use client::NetworkProxyClient;
pub use error::{AllowedHostsError, WireError};
pub use server::{NetworkProxyServer, ViolationNotifier};
