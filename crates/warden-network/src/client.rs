//! Sandboxee-side half of the network proxy.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;

use warden_comms::{Comms, CommsError, SANDBOXEE_NETWORK_PROXY_FD};

use crate::wire::encode_sockaddr;

/// Requests outbound connections from the host's proxy server.
#[derive(Debug)]
pub struct NetworkProxyClient {
    comms: Comms,
    exchange: Mutex<()>,
}

impl NetworkProxyClient {
    /// Wraps an existing proxy channel.
    #[must_use]
    pub const fn new(comms: Comms) -> Self {
        Self {
            comms,
            exchange: Mutex::new(()),
        }
    }

    /// Adopts the proxy channel inherited at
    /// [`SANDBOXEE_NETWORK_PROXY_FD`].
    ///
    /// # Errors
    ///
    /// Fails when the descriptor is not open, i.e. the policy did not enable
    /// the proxy.
    pub fn from_inherited() -> Result<Self, CommsError> {
        Comms::from_inherited_fd(SANDBOXEE_NETWORK_PROXY_FD).map(Self::new)
    }

    /// Connects to `addr` through the proxy.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by the host, or an error wrapping the comms
    /// failure. A denied destination never returns: the host kills the
    /// sandboxee.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let _exchange = self
            .exchange
            .lock()
            .map_err(|_| io::Error::other("network proxy client lock poisoned"))?;
        self.comms.send_bytes(&encode_sockaddr(&addr)).map_err(io::Error::other)?;
        let code = self.comms.recv_i32().map_err(io::Error::other)?;
        if code != 0 {
            return Err(io::Error::from_raw_os_error(code));
        }
        let fd = self.comms.recv_fd().map_err(io::Error::other)?;
        Ok(TcpStream::from(fd))
    }
}
