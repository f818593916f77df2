//! Host side of the RPC exchange on one session's comms.

use tracing::trace;
use warden_comms::Comms;

use super::{Arg, HANDSHAKE_MAGIC, RemotePtr, Request, Response, Value};
use crate::error::SandboxError;

const RPC_TARGET: &str = "warden_sandbox::rpc";

/// Requests for one session. Each method is one request/response exchange.
pub(crate) struct Channel<'a> {
    comms: &'a Comms,
    session: u64,
}

impl<'a> Channel<'a> {
    pub(crate) const fn new(comms: &'a Comms, session: u64) -> Self {
        Self { comms, session }
    }

    pub(crate) fn handshake(&self) -> Result<(), SandboxError> {
        match self.comms.recv_u32()? {
            HANDSHAKE_MAGIC => Ok(()),
            magic => Err(SandboxError::Handshake { magic }),
        }
    }

    pub(crate) fn call(&self, name: &str, args: &[Arg]) -> Result<Value, SandboxError> {
        match self.invoke(name, args)? {
            Response::Value(value) => Ok(value),
            Response::Pointer { .. } => Err(SandboxError::Protocol(format!(
                "{name} returned a pointer; use call_ptr"
            ))),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn call_ptr(&self, name: &str, args: &[Arg]) -> Result<RemotePtr, SandboxError> {
        match self.invoke(name, args)? {
            Response::Pointer { addr, len } => Ok(RemotePtr::new(self.session, addr, len)),
            Response::Value(value) => Err(SandboxError::Protocol(format!(
                "{name} returned {value:?} instead of a pointer"
            ))),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn allocate(&self, size: u64) -> Result<RemotePtr, SandboxError> {
        match self.exchange(&Request::Allocate { size })? {
            Response::Allocated { addr } => Ok(RemotePtr::new(self.session, addr, size)),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn free(&self, ptr: &RemotePtr) -> Result<(), SandboxError> {
        self.check(ptr)?;
        self.expect_done(&Request::Free { addr: ptr.addr() })
    }

    pub(crate) fn transfer_to(&self, ptr: &RemotePtr, data: &[u8]) -> Result<(), SandboxError> {
        self.check(ptr)?;
        let len = u64::try_from(data.len()).unwrap_or(u64::MAX);
        if len > ptr.len() {
            return Err(SandboxError::InvalidArgument(format!(
                "{len} bytes do not fit a region of {}",
                ptr.len()
            )));
        }
        self.comms.send_message(&Request::TransferTo {
            addr: ptr.addr(),
            len,
        })?;
        self.comms.send_bytes(data)?;
        match self.receive()? {
            Response::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn transfer_from(&self, ptr: &RemotePtr) -> Result<Vec<u8>, SandboxError> {
        self.check(ptr)?;
        match self.exchange(&Request::TransferFrom {
            addr: ptr.addr(),
            len: ptr.len(),
        })? {
            Response::Bytes => Ok(self.comms.recv_bytes()?),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn exit(&self) -> Result<(), SandboxError> {
        self.expect_done(&Request::Exit)
    }

    fn invoke(&self, name: &str, args: &[Arg]) -> Result<Response, SandboxError> {
        let lowered = args
            .iter()
            .map(|arg| self.lower(arg))
            .collect::<Result<Vec<_>, _>>()?;
        trace!(target: RPC_TARGET, session = self.session, name, "calling");
        self.exchange(&Request::Call {
            name: name.to_owned(),
            args: lowered,
        })
    }

    fn lower(&self, arg: &Arg) -> Result<Value, SandboxError> {
        match arg {
            Arg::Value(Value::Ptr(_)) => Err(SandboxError::InvalidArgument(String::from(
                "sandboxee addresses must be passed as RemotePtr",
            ))),
            Arg::Value(value) => Ok(value.clone()),
            Arg::Ptr(ptr) => {
                self.check(ptr)?;
                Ok(Value::Ptr(ptr.addr()))
            }
        }
    }

    fn check(&self, ptr: &RemotePtr) -> Result<(), SandboxError> {
        if ptr.session() == self.session {
            Ok(())
        } else {
            Err(SandboxError::ForeignPointer {
                pointer_session: ptr.session(),
                active_session: self.session,
            })
        }
    }

    fn exchange(&self, request: &Request) -> Result<Response, SandboxError> {
        self.comms.send_message(request)?;
        self.receive()
    }

    fn receive(&self) -> Result<Response, SandboxError> {
        match self.comms.recv_message::<Response>()? {
            Response::Error(status) => Err(SandboxError::Remote(status)),
            response => Ok(response),
        }
    }

    fn expect_done(&self, request: &Request) -> Result<(), SandboxError> {
        match self.exchange(request)? {
            Response::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> SandboxError {
    SandboxError::Protocol(format!("unexpected response {response:?}"))
}
