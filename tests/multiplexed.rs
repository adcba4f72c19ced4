// tests/multiplexed.rs

use raccept::{
  channel_monitor, Acceptor, AcceptorConfig, AcceptorKind, AcceptorState, ConnError, ConnectionEvent,
  ConnectionManager, ListenSocket, ManagerOptions, MultiplexedAcceptor, NullMonitor,
};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod common;
use common::{Behavior, CountingSource, FlakySocket, LONG_TIMEOUT};

fn multiplexed_manager() -> (ConnectionManager, raccept::monitor::MonitorReceiver) {
  common::setup_tracing();
  let (monitor, rx) = channel_monitor(512);
  let options = ManagerOptions::default()
    .with_acceptor_kind(AcceptorKind::Multiplexed)
    .with_shutdown_timeout(Duration::from_millis(500));
  (ConnectionManager::new().with_options(options).with_monitor(monitor), rx)
}

#[test]
fn one_loop_serves_many_listeners() {
  let (manager, _rx) = multiplexed_manager();
  let source = CountingSource::new(Behavior::Echo);
  let addrs: Vec<_> = (0..3)
    .map(|i| manager.connect_tcp(&format!("mux-{}", i), "127.0.0.1:0", source.clone()).unwrap())
    .collect();

  for (i, addr) in addrs.iter().enumerate() {
    let mut client = common::connect_client(*addr);
    let payload = format!("listener-{}", i);
    assert_eq!(common::echo_roundtrip(&mut client, payload.as_bytes()), payload.as_bytes());
  }

  // Several pending connections on one listener are all drained.
  let mut burst: Vec<TcpStream> = (0..5).map(|_| common::connect_client(addrs[0])).collect();
  for client in burst.iter_mut() {
    assert_eq!(common::echo_roundtrip(client, b"burst"), b"burst");
  }
  drop(burst);

  manager.dispose_all();
  assert!(manager.names().is_empty());
  assert!(common::wait_until(LONG_TIMEOUT, || source.released() == source.acquired()));
  assert_eq!(source.acquired(), 8);
}

#[test]
fn disconnecting_one_listener_leaves_the_others_running() {
  let (manager, rx) = multiplexed_manager();
  let source = CountingSource::new(Behavior::Echo);
  let kept = manager.connect_tcp("kept", "127.0.0.1:0", source.clone()).unwrap();
  let removed = manager.connect_tcp("removed", "127.0.0.1:0", source.clone()).unwrap();

  manager.disconnect("removed", false).unwrap();
  assert!(!manager.is_connected("removed"));
  assert!(TcpStream::connect(removed).is_err());
  let closed = common::wait_for_event(&rx, LONG_TIMEOUT, |e| {
    matches!(e, ConnectionEvent::Closed { name } if name == "removed")
  });
  assert!(closed.is_some());

  let mut client = common::connect_client(kept);
  assert_eq!(common::echo_roundtrip(&mut client, b"alive"), b"alive");

  // The freed name can be reused on the same loop.
  manager.connect_tcp("removed", "127.0.0.1:0", source).unwrap();
  assert!(manager.is_connected("removed"));
}

#[test]
fn forced_close_applies_per_listener() {
  let (manager, _rx) = multiplexed_manager();
  let source = CountingSource::new(Behavior::Hold);
  let addr = manager.connect_tcp("held", "127.0.0.1:0", source.clone()).unwrap();

  let mut client = common::connect_client(addr);
  assert!(common::wait_until(LONG_TIMEOUT, || manager.live_connections("held") == Some(1)));

  let started = Instant::now();
  manager.disconnect("held", true).unwrap();
  assert!(started.elapsed() < Duration::from_millis(500), "took {:?}", started.elapsed());
  assert!(common::is_closed_by_server(&mut client));
  assert!(common::wait_until(LONG_TIMEOUT, || source.released() == 1));
}

#[test]
fn duplicate_names_are_rejected_on_the_shared_loop() {
  let (manager, _rx) = multiplexed_manager();
  let source = CountingSource::new(Behavior::Immediate);
  manager.connect_tcp("dup", "127.0.0.1:0", source.clone()).unwrap();
  let err = manager.connect_tcp("dup", "127.0.0.1:0", source).unwrap_err();
  assert!(matches!(err, ConnError::DuplicateName(_)), "got {:?}", err);
}

#[test]
fn standalone_loop_lifecycle() {
  common::setup_tracing();
  let mux = MultiplexedAcceptor::new("standalone", Arc::new(NullMonitor)).unwrap();
  assert_eq!(mux.state(), AcceptorState::Created);
  mux.start(None).unwrap();
  assert!(mux.is_running());

  let source = CountingSource::new(Behavior::Echo);
  let listen = raccept::bind_tcp("127.0.0.1:0", 16).unwrap();
  let listener = mux
    .register(AcceptorConfig::new("only", Box::new(listen), source.clone()).unwrap())
    .unwrap();
  listener.start(None).unwrap();
  let addr = listener.local_addr().unwrap();

  let mut client = common::connect_client(addr);
  assert_eq!(common::echo_roundtrip(&mut client, b"hello"), b"hello");
  assert_eq!(mux.live_connections(), 1);
  drop(client);
  assert!(common::wait_until(LONG_TIMEOUT, || mux.live_connections() == 0));

  mux.close(Duration::from_millis(100), true).unwrap();
  assert_eq!(mux.state(), AcceptorState::Stopped);
  assert_eq!(listener.state(), AcceptorState::Stopped);
  assert_eq!(mux.listener_count(), 0);
  assert!(TcpStream::connect(addr).is_err());
  assert_eq!(source.released(), 1);
}

fn flaky_listener(
  failures: usize,
) -> (
  MultiplexedAcceptor,
  Arc<CountingSource>,
  std::net::SocketAddr,
  raccept::monitor::MonitorReceiver,
) {
  common::setup_tracing();
  let (monitor, rx) = channel_monitor(512);
  let mux = MultiplexedAcceptor::new("flaky-mux", monitor).unwrap();
  mux.start(None).unwrap();
  let source = CountingSource::new(Behavior::Hold);
  let listen = FlakySocket::bind(failures);
  let addr = listen.local_addr().unwrap();
  let listener = mux
    .register(AcceptorConfig::new("flaky", Box::new(listen), source.clone()).unwrap())
    .unwrap();
  listener.start(None).unwrap();
  (mux, source, addr, rx)
}

fn accept_failures(rx: &raccept::monitor::MonitorReceiver) -> usize {
  common::drain_events(rx)
    .into_iter()
    .filter(|e| matches!(e, ConnectionEvent::AcceptFailed { name, .. } if name == "flaky"))
    .count()
}

#[test]
fn queued_connections_survive_an_accept_error() {
  let (mux, source, addr, rx) = flaky_listener(1);

  let _first = common::connect_client(addr);
  let _second = common::connect_client(addr);
  assert!(
    common::wait_until(LONG_TIMEOUT, || source.acquired() == 2),
    "acquired {}",
    source.acquired()
  );
  assert_eq!(accept_failures(&rx), 1);

  mux.close(Duration::ZERO, true).unwrap();
  assert!(common::wait_until(LONG_TIMEOUT, || source.released() == 2));
}

#[test]
fn persistent_accept_errors_rearm_the_listener() {
  // More failures than one readiness pass tolerates before backing off.
  let (mux, source, addr, rx) = flaky_listener(12);

  let _client = common::connect_client(addr);
  assert!(
    common::wait_until(LONG_TIMEOUT, || source.acquired() == 1),
    "acquired {}",
    source.acquired()
  );
  assert_eq!(accept_failures(&rx), 12);
  assert!(mux.is_running());

  mux.close(Duration::ZERO, true).unwrap();
  assert!(common::wait_until(LONG_TIMEOUT, || source.released() == 1));
}
