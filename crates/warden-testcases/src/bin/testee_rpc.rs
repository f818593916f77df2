//! RPC sandboxee serving a handful of functions to the host.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use warden_network::NetworkProxyClient;
use warden_sandbox::{CallContext, SandboxeeClient, Value};
use warden_util::{Status, StatusCode};

fn main() -> ExitCode {
    let Ok(client) = SandboxeeClient::from_inherited() else {
        return ExitCode::from(2);
    };
    let mut proxy: Option<NetworkProxyClient> = None;
    let served = client
        .register("sum", sum)
        .register("concat", concat)
        .register("upper", upper)
        .register("reversed", reversed)
        .register("sleep", sleep)
        .register("violate", violate)
        .register("fail", |_, _| Err(Status::internal("requested failure")))
        .register("connect", move |_, args| connect(&mut proxy, args))
        .serve();
    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn sum(_: &mut CallContext<'_>, args: &[Value]) -> Result<Value, Status> {
    args.iter()
        .try_fold(0_i64, |total, arg| match arg {
            Value::Int(value) => total
                .checked_add(*value)
                .ok_or_else(|| Status::new(StatusCode::OutOfRange, "sum overflows")),
            _ => Err(Status::invalid_argument("sum takes integers")),
        })
        .map(Value::Int)
}

fn concat(_: &mut CallContext<'_>, args: &[Value]) -> Result<Value, Status> {
    match args {
        [Value::Str(head), Value::Str(tail)] => Ok(Value::Str(format!("{head}{tail}"))),
        _ => Err(Status::invalid_argument("concat takes two strings")),
    }
}

fn upper(context: &mut CallContext<'_>, args: &[Value]) -> Result<Value, Status> {
    match args {
        [Value::Ptr(addr)] => {
            context.buffer_mut(*addr)?.make_ascii_uppercase();
            Ok(Value::Void)
        }
        _ => Err(Status::invalid_argument("upper takes a buffer")),
    }
}

/// Returns a new region holding the buffer's bytes back to front.
fn reversed(context: &mut CallContext<'_>, args: &[Value]) -> Result<Value, Status> {
    match args {
        [Value::Ptr(addr)] => {
            let mut bytes = context.buffer(*addr)?.to_vec();
            bytes.reverse();
            Ok(Value::Ptr(context.allocate(bytes)))
        }
        _ => Err(Status::invalid_argument("reversed takes a buffer")),
    }
}

fn sleep(_: &mut CallContext<'_>, args: &[Value]) -> Result<Value, Status> {
    match args {
        [Value::UInt(millis)] => {
            thread::sleep(Duration::from_millis(*millis));
            Ok(Value::Void)
        }
        _ => Err(Status::invalid_argument("sleep takes milliseconds")),
    }
}

/// Makes a syscall no sandboxee policy allows.
fn violate(_: &mut CallContext<'_>, _: &[Value]) -> Result<Value, Status> {
    // SAFETY: `sync` takes no arguments and touches no memory.
    let rc = unsafe { libc::syscall(libc::SYS_sync) };
    Ok(Value::Int(rc))
}

/// Connects through the network proxy and reports the errno, 0 on success.
fn connect(proxy: &mut Option<NetworkProxyClient>, args: &[Value]) -> Result<Value, Status> {
    let [Value::Str(spec)] = args else {
        return Err(Status::invalid_argument("connect takes host:port"));
    };
    let addr: SocketAddr = spec
        .parse()
        .map_err(|_| Status::invalid_argument(format!("{spec} is not host:port")))?;
    if proxy.is_none() {
        let client = SandboxeeClient::network_proxy()
            .map_err(|error| Status::failed_precondition(error.to_string()))?;
        *proxy = Some(client);
    }
    let Some(client) = proxy.as_ref() else {
        return Err(Status::internal("network proxy unavailable"));
    };
    match client.connect(addr) {
        Ok(_stream) => Ok(Value::Int(0)),
        Err(error) => Ok(Value::Int(error.raw_os_error().map_or(-1, i64::from))),
    }
}
