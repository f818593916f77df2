//! RPC sessions with `testee_rpc`.
//!
//! Tests skip when the host forbids tracing or user namespaces.

use std::net::TcpListener;
use std::time::Duration;

use rstest::{fixture, rstest};
use warden_sandbox::{Arg, Outcome, Sandbox, SandboxError, SandboxSpec, Value, Violation};
use warden_testcases::{require_namespaces, require_tracing};
use warden_util::StatusCode;

const TESTEE: &str = env!("CARGO_BIN_EXE_testee_rpc");

fn unnamespaced() -> SandboxSpec {
    SandboxSpec::new(TESTEE).policy(|builder| builder.disable_namespaces().allow_sleep())
}

#[fixture]
fn sandbox() -> Sandbox {
    Sandbox::new(unnamespaced())
}

fn int(value: i64) -> Arg {
    Value::Int(value).into()
}

fn string(value: &str) -> Arg {
    Value::Str(value.to_owned()).into()
}

fn terminated_outcome(error: &SandboxError) -> Option<&Outcome> {
    error.result().map(|result| result.outcome())
}

#[rstest]
fn calls_return_values(mut sandbox: Sandbox) {
    require_tracing!();
    sandbox.init().expect("init");
    assert_eq!(
        sandbox.call("sum", &[int(20), int(22)]).expect("sum"),
        Value::Int(42)
    );
    assert_eq!(
        sandbox
            .call("concat", &[string("war"), string("den")])
            .expect("concat"),
        Value::Str(String::from("warden"))
    );
    let result = sandbox.terminate(true).expect("terminate");
    assert_eq!(result.exit_code(), Some(0), "{result}");
}

#[rstest]
fn buffers_round_trip_through_sandboxee_memory(mut sandbox: Sandbox) {
    require_tracing!();
    sandbox.init().expect("init");
    let buffer = sandbox.allocate(5).expect("allocate");
    sandbox
        .transfer_to_sandboxee(&buffer, b"hello")
        .expect("transfer to");
    sandbox.call("upper", &[(&buffer).into()]).expect("upper");
    assert_eq!(
        sandbox.transfer_from_sandboxee(&buffer).expect("transfer from"),
        b"HELLO"
    );

    let reversed = sandbox
        .call_ptr("reversed", &[(&buffer).into()])
        .expect("reversed");
    assert_eq!(reversed.len(), 5);
    assert_eq!(
        sandbox.transfer_from_sandboxee(&reversed).expect("transfer from"),
        b"OLLEH"
    );
    sandbox.free(&reversed).expect("free");
    sandbox.free(&buffer).expect("free");
    sandbox.terminate(true).expect("terminate");
}

#[rstest]
fn remote_errors_leave_the_session_running(mut sandbox: Sandbox) {
    require_tracing!();
    sandbox.init().expect("init");
    let error = sandbox.call("fail", &[]).expect_err("fail");
    assert!(
        matches!(&error, SandboxError::Remote(status) if status.code() == StatusCode::Internal),
        "{error}"
    );
    assert!(sandbox.is_active());
    assert_eq!(sandbox.call("sum", &[int(1)]).expect("sum"), Value::Int(1));
    sandbox.terminate(true).expect("terminate");
}

#[rstest]
fn violations_end_the_session(mut sandbox: Sandbox) {
    require_tracing!();
    sandbox.init().expect("init");
    let error = sandbox.call("violate", &[]).expect_err("violation");
    match terminated_outcome(&error) {
        Some(Outcome::Violation(Violation::Syscall { name, .. })) => {
            assert_eq!(name.as_deref(), Some("sync"));
        }
        other => panic!("expected a syscall violation, got {other:?}"),
    }
    assert!(!sandbox.is_active());
    let again = sandbox.call("sum", &[]).expect_err("session ended");
    assert!(terminated_outcome(&again).is_some(), "{again}");
}

#[rstest]
fn pointers_do_not_survive_a_restart(mut sandbox: Sandbox) {
    require_tracing!();
    sandbox.init().expect("init");
    let stale = sandbox.allocate(4).expect("allocate");
    sandbox.terminate(false).expect("terminate");

    sandbox.init().expect("second init");
    let error = sandbox
        .transfer_from_sandboxee(&stale)
        .expect_err("stale pointer");
    assert!(matches!(error, SandboxError::ForeignPointer { .. }), "{error}");
    sandbox.terminate(true).expect("terminate");
}

#[rstest]
fn wall_time_limit_applies_to_calls(mut sandbox: Sandbox) {
    require_tracing!();
    sandbox.init().expect("init");
    sandbox
        .set_wall_time_limit(Some(Duration::from_millis(200)))
        .expect("limit");
    let error = sandbox
        .call("sleep", &[Value::UInt(10_000).into()])
        .expect_err("timeout");
    assert_eq!(terminated_outcome(&error), Some(&Outcome::Timeout));
}

#[rstest]
fn network_proxy_enforces_allowed_hosts() {
    require_namespaces!();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let other_port = port.checked_add(1).unwrap_or(port - 1);
    let spec = SandboxSpec::new(TESTEE).policy(move |builder| {
        builder
            .add_network_proxy_policy()
            .allow_ipv4("127.0.0.1", Some(port))
    });
    let mut sandbox = Sandbox::new(spec);
    sandbox.init().expect("init");

    let allowed = sandbox
        .call("connect", &[string(&format!("127.0.0.1:{port}"))])
        .expect("allowed connect");
    assert_eq!(allowed, Value::Int(0));

    let error = sandbox
        .call("connect", &[string(&format!("127.0.0.1:{other_port}"))])
        .expect_err("denied connect");
    match terminated_outcome(&error) {
        Some(Outcome::Violation(Violation::Network { description })) => {
            assert_eq!(description, &format!("127.0.0.1:{other_port}"));
        }
        other => panic!("expected a network violation, got {other:?}"),
    }
}
