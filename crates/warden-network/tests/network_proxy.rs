//! Behaviour tests for the proxy server and client pair.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use warden_comms::Comms;
use warden_network::{AllowedHosts, NetworkProxyClient, NetworkProxyServer, ViolationNotifier};

#[derive(Default)]
struct RecordingNotifier {
    violations: Mutex<Vec<String>>,
}

impl ViolationNotifier for RecordingNotifier {
    fn notify_violation(&self, description: &str) {
        if let Ok(mut violations) = self.violations.lock() {
            violations.push(description.to_owned());
        }
    }
}

#[derive(Default)]
struct World {
    listener: Option<TcpListener>,
    hosts: AllowedHosts,
    notifier: Arc<RecordingNotifier>,
    server: Option<JoinHandle<()>>,
    outcome: Option<io::Result<TcpStream>>,
}

impl World {
    fn target(&self) -> SocketAddr {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .expect("listener bound")
    }

    fn start(&mut self) -> NetworkProxyClient {
        let (host_side, sandboxee_side) = Comms::pair().expect("pair");
        let notifier: Arc<dyn ViolationNotifier> = self.notifier.clone();
        let server =
            NetworkProxyServer::new(host_side, Arc::new(self.hosts.clone()), notifier);
        self.server = Some(thread::spawn(move || server.run()));
        NetworkProxyClient::new(sandboxee_side)
    }
}

#[fixture]
fn world() -> World {
    World::default()
}

#[given("a listener on the loopback interface")]
fn given_listener(world: &mut World) {
    world.listener = Some(TcpListener::bind("127.0.0.1:0").expect("listener"));
}

#[given("the allow-list admits the listener")]
fn given_allow_listener(world: &mut World) {
    let port = world.target().port();
    world
        .hosts
        .allow_ipv4("127.0.0.0/8", Some(port))
        .expect("rule");
}

#[given("the allow-list admits only port {port}")]
fn given_allow_port(world: &mut World, port: u16) {
    world.hosts.allow_ipv4("127.0.0.1", Some(port)).expect("rule");
}

#[when("the client connects to the listener")]
fn when_connect(world: &mut World) {
    let client = world.start();
    world.outcome = Some(client.connect(world.target()));
    drop(client);
    if let Some(server) = world.server.take() {
        server.join().expect("server thread");
    }
}

#[when("the client attempts to connect to the listener")]
fn when_attempt(world: &mut World) {
    let client = world.start();
    let target = world.target();
    // The server never answers a denied request; hang up once it stops.
    let attempt = thread::spawn(move || client.connect(target).is_ok());
    if let Some(server) = world.server.take() {
        server.join().expect("server thread");
    }
    drop(attempt);
}

#[then("the client holds a connected socket")]
fn then_connected(world: &mut World) {
    let stream = match world.outcome.take() {
        Some(Ok(stream)) => stream,
        Some(Err(error)) => panic!("connect failed: {error}"),
        None => panic!("no connection attempted"),
    };
    let listener = world.listener.as_ref().expect("listener");
    let (accepted, _) = listener.accept().expect("accept");
    assert_eq!(
        accepted.peer_addr().expect("peer"),
        stream.local_addr().expect("local")
    );
}

#[then("no violation is reported")]
fn then_no_violation(world: &mut World) {
    let violations = world.notifier.violations.lock().expect("violations");
    assert!(violations.is_empty(), "unexpected violations: {violations:?}");
}

#[then("the violation {host} is reported")]
fn then_violation(world: &mut World, host: String) {
    let expected = format!("{}:{}", host.trim_matches('"'), world.target().port());
    let violations = world.notifier.violations.lock().expect("violations");
    assert_eq!(*violations, [expected]);
}

#[scenario(path = "tests/features/network_proxy.feature")]
fn network_proxy(world: World) {
    let _ = world;
}
