//! Host-side half of the network proxy.

use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};
use warden_comms::{Comms, CommsError};

use crate::allowed_hosts::AllowedHosts;
use crate::wire::decode_sockaddr;


const PROXY_TARGET: &str = "warden_network::proxy";

/// Receives word of a denied connection attempt.
///
/// The monitor implements this to wake its supervision loop, which then
/// kills the sandboxee.
#[cfg_attr(test, mockall::automock)]
pub trait ViolationNotifier: Send + Sync {
    /// Called once, from the proxy thread, with a `host:port` description of
    /// the destination that was refused.
    fn notify_violation(&self, description: &str);
}

/// Services connect requests from one sandboxee.
///
/// Each request is a serialised socket address. Allowed destinations are
/// connected on the host side and the socket is passed back; a denied
/// destination is a policy violation that ends the service.
pub struct NetworkProxyServer {
    comms: Comms,
    allowed_hosts: Arc<AllowedHosts>,
    notifier: Arc<dyn ViolationNotifier>,
    violation: AtomicBool,
}

impl NetworkProxyServer {
    /// Creates a server answering requests on `comms`.
    #[must_use]
    pub fn new(
        comms: Comms,
        allowed_hosts: Arc<AllowedHosts>,
        notifier: Arc<dyn ViolationNotifier>,
    ) -> Self {
        Self {
            comms,
            allowed_hosts,
            notifier,
            violation: AtomicBool::new(false),
        }
    }

    /// Handles exactly one connect request.
    ///
    /// Replies with `0` followed by the connected descriptor, or with an
    /// errno. Malformed addresses get `EINVAL`. A denied destination gets no
    /// reply.
    ///
    /// # Errors
    ///
    /// Propagates comms failures; the channel is unusable afterwards.
    pub fn process_connect_request(&self) -> Result<(), CommsError> {
        let request = self.comms.recv_bytes()?;
        let addr = match decode_sockaddr(&request) {
            Ok(addr) => addr,
            Err(error) => {
                warn!(target: PROXY_TARGET, %error, "rejecting malformed connect request");
                return self.comms.send_i32(error.errno());
            }
        };

        if !self.allowed_hosts.is_host_allowed(&addr) {
            self.notify_violation(&addr);
            return Ok(());
        }

        match TcpStream::connect(addr) {
            Ok(stream) => {
                debug!(target: PROXY_TARGET, %addr, "proxied connection established");
                self.comms.send_i32(0)?;
                self.comms.send_fd(stream.as_fd())
            }
            Err(error) => {
                debug!(target: PROXY_TARGET, %addr, %error, "proxied connection failed");
                self.comms
                    .send_i32(error.raw_os_error().unwrap_or(libc::EIO))
            }
        }
    }

    /// Serves requests until the channel fails or a violation occurs.
    pub fn run(&self) {
        while !self.violation.load(Ordering::Relaxed) {
            if let Err(error) = self.process_connect_request() {
                debug!(target: PROXY_TARGET, %error, "network proxy channel closed");
                break;
            }
        }
    }

    /// Returns `true` once a denied destination was requested.
    #[must_use]
    pub fn violation_occurred(&self) -> bool {
        self.violation.load(Ordering::Acquire)
    }

    fn notify_violation(&self, addr: &SocketAddr) {
        let description = addr.to_string();
        info!(target: PROXY_TARGET, destination = %description, "network policy violation");
        self.violation.store(true, Ordering::Release);
        self.notifier.notify_violation(&description);
    }
}
