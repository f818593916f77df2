//! Sandboxee side of the RPC exchange.

use std::collections::HashMap;
use std::fmt;

use warden_comms::{Comms, CommsError, SANDBOXEE_COMMS_FD};
use warden_network::NetworkProxyClient;
use warden_util::{Status, StatusCode};

use super::{HANDSHAKE_MAGIC, Request, Response, Value};

type Handler = Box<dyn FnMut(&mut CallContext<'_>, &[Value]) -> Result<Value, Status> + Send>;

struct Region {
    bytes: Box<[u8]>,
    len: usize,
}

/// Regions allocated on behalf of the host, keyed by address.
#[derive(Default)]
struct Arena {
    regions: HashMap<u64, Region>,
}

impl Arena {
    fn allocate(&mut self, bytes: Vec<u8>) -> u64 {
        let len = bytes.len();
        let storage = if bytes.is_empty() {
            vec![0_u8].into_boxed_slice()
        } else {
            bytes.into_boxed_slice()
        };
        let addr = u64::try_from(storage.as_ptr().addr()).unwrap_or(u64::MAX);
        self.regions.insert(
            addr,
            Region {
                bytes: storage,
                len,
            },
        );
        addr
    }

    fn region(&self, addr: u64) -> Result<&[u8], Status> {
        let region = self.regions.get(&addr).ok_or_else(|| unknown(addr))?;
        region.bytes.get(..region.len).ok_or_else(|| unknown(addr))
    }

    fn region_mut(&mut self, addr: u64) -> Result<&mut [u8], Status> {
        let region = self.regions.get_mut(&addr).ok_or_else(|| unknown(addr))?;
        region.bytes.get_mut(..region.len).ok_or_else(|| unknown(addr))
    }

    fn free(&mut self, addr: u64) -> Result<(), Status> {
        self.regions.remove(&addr).map(drop).ok_or_else(|| unknown(addr))
    }
}

fn unknown(addr: u64) -> Status {
    Status::invalid_argument(format!("0x{addr:x} is not an allocated region"))
}

fn checked_len(len: u64, available: usize) -> Result<usize, Status> {
    usize::try_from(len)
        .ok()
        .filter(|size| *size <= available)
        .ok_or_else(|| {
            Status::new(StatusCode::OutOfRange, format!("{len} bytes exceed the region"))
        })
}

/// Memory access for a registered function.
pub struct CallContext<'a> {
    arena: &'a mut Arena,
}

impl CallContext<'_> {
    /// Contents of the region at `addr`.
    ///
    /// # Errors
    ///
    /// Fails when `addr` is not an allocated region.
    pub fn buffer(&self, addr: u64) -> Result<&[u8], Status> {
        self.arena.region(addr)
    }

    /// Mutable contents of the region at `addr`.
    ///
    /// # Errors
    ///
    /// Fails when `addr` is not an allocated region.
    pub fn buffer_mut(&mut self, addr: u64) -> Result<&mut [u8], Status> {
        self.arena.region_mut(addr)
    }

    /// Stores `bytes` in a new region the host can read, and returns its
    /// address for a [`Value::Ptr`] result.
    pub fn allocate(&mut self, bytes: Vec<u8>) -> u64 {
        self.arena.allocate(bytes)
    }
}

/// Serves host requests from inside the sandboxee.
///
/// ```no_run
/// use warden_sandbox::{SandboxeeClient, Value};
/// use warden_util::Status;
///
/// # fn main() -> Result<(), warden_comms::CommsError> {
/// SandboxeeClient::from_inherited()?
///     .register("add", |_, args| match args {
///         [Value::Int(a), Value::Int(b)] => Ok(Value::Int(a + b)),
///         _ => Err(Status::invalid_argument("add takes two integers")),
///     })
///     .serve()
/// # }
/// ```
pub struct SandboxeeClient {
    comms: Comms,
    functions: HashMap<String, Handler>,
    arena: Arena,
}

impl fmt::Debug for SandboxeeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("SandboxeeClient")
            .field("comms", &self.comms)
            .field("functions", &names)
            .field("regions", &self.arena.regions.len())
            .finish()
    }
}

impl SandboxeeClient {
    /// Serves on `comms`.
    #[must_use]
    pub fn new(comms: Comms) -> Self {
        Self {
            comms,
            functions: HashMap::new(),
            arena: Arena::default(),
        }
    }

    /// Serves on the channel inherited at
    /// [`SANDBOXEE_COMMS_FD`](warden_comms::SANDBOXEE_COMMS_FD).
    ///
    /// # Errors
    ///
    /// Fails when the process was not started by a monitor.
    pub fn from_inherited() -> Result<Self, CommsError> {
        Comms::from_inherited_fd(SANDBOXEE_COMMS_FD).map(Self::new)
    }

    /// Makes `function` callable as `name`, replacing an earlier
    /// registration.
    #[must_use]
    pub fn register<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: FnMut(&mut CallContext<'_>, &[Value]) -> Result<Value, Status> + Send + 'static,
    {
        self.functions.insert(name.into(), Box::new(function));
        self
    }

    /// The network proxy channel, when the policy enabled it.
    ///
    /// # Errors
    ///
    /// Fails when no proxy channel was inherited.
    pub fn network_proxy() -> Result<NetworkProxyClient, CommsError> {
        NetworkProxyClient::from_inherited()
    }

    /// Sends the handshake and answers requests until the host asks the
    /// sandboxee to exit.
    ///
    /// # Errors
    ///
    /// Fails when the channel breaks.
    pub fn serve(mut self) -> Result<(), CommsError> {
        self.comms.send_u32(HANDSHAKE_MAGIC)?;
        loop {
            let request = self.comms.recv_message::<Request>()?;
            let exit = request == Request::Exit;
            let (response, payload) = self.handle(&request)?;
            self.comms.send_message(&response)?;
            if let Some(bytes) = payload {
                self.comms.send_bytes(&bytes)?;
            }
            if exit {
                return Ok(());
            }
        }
    }

    fn handle(&mut self, request: &Request) -> Result<(Response, Option<Vec<u8>>), CommsError> {
        let response = match request {
            Request::Call { name, args } => self.call(name, args),
            Request::Allocate { size } => match usize::try_from(*size) {
                Ok(size) => Response::Allocated {
                    addr: self.arena.allocate(vec![0; size]),
                },
                Err(_) => Response::Error(Status::new(
                    StatusCode::ResourceExhausted,
                    format!("cannot allocate {size} bytes"),
                )),
            },
            Request::Free { addr } => done_or_error(self.arena.free(*addr)),
            Request::TransferTo { addr, len } => {
                let bytes = self.comms.recv_bytes()?;
                done_or_error(self.store(*addr, *len, &bytes))
            }
            Request::TransferFrom { addr, len } => {
                return Ok(match self.load(*addr, *len) {
                    Ok(bytes) => (Response::Bytes, Some(bytes)),
                    Err(status) => (Response::Error(status), None),
                });
            }
            Request::Exit => Response::Done,
        };
        Ok((response, None))
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Response {
        let Some(function) = self.functions.get_mut(name) else {
            return Response::Error(Status::new(
                StatusCode::NotFound,
                format!("no function named {name}"),
            ));
        };
        let mut context = CallContext {
            arena: &mut self.arena,
        };
        match function(&mut context, args) {
            Ok(Value::Ptr(addr)) => match self.arena.region(addr) {
                Ok(region) => Response::Pointer {
                    addr,
                    len: region.len() as u64,
                },
                Err(status) => Response::Error(status),
            },
            Ok(value) => Response::Value(value),
            Err(status) => Response::Error(status),
        }
    }

    fn store(&mut self, addr: u64, len: u64, bytes: &[u8]) -> Result<(), Status> {
        if usize::try_from(len).ok() != Some(bytes.len()) {
            return Err(Status::invalid_argument(format!(
                "announced {len} bytes, received {}",
                bytes.len()
            )));
        }
        let region = self.arena.region_mut(addr)?;
        let count = checked_len(len, region.len())?;
        let target = region.get_mut(..count).ok_or_else(|| unknown(addr))?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    fn load(&self, addr: u64, len: u64) -> Result<Vec<u8>, Status> {
        let region = self.arena.region(addr)?;
        let count = checked_len(len, region.len())?;
        region
            .get(..count)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| unknown(addr))
    }
}

fn done_or_error(result: Result<(), Status>) -> Response {
    match result {
        Ok(()) => Response::Done,
        Err(status) => Response::Error(status),
    }
}
