// tests/common.rs
#![allow(dead_code)] // Not every test binary uses every helper

use raccept::monitor::MonitorReceiver;
use raccept::{
  ConnError, Connection, ConnectionEvent, ConnectionHandler, HandlerSource, ListenSocket, TcpListenSocket,
};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

pub const SHORT_TIMEOUT: Duration = Duration::from_millis(250);
pub const LONG_TIMEOUT: Duration = Duration::from_secs(3);

static TRACING_INIT: Once = Once::new();

pub fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    // Can be overridden by RUST_LOG
    let default_filter = "raccept=debug,info";
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
      .with_max_level(tracing::Level::TRACE)
      .with_env_filter(env_filter)
      .with_target(true)
      .with_line_number(true)
      .with_thread_names(true)
      .with_span_events(FmtSpan::CLOSE)
      .with_test_writer()
      .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global tracing subscriber");
  });
}

/// What handlers built by a `CountingSource` do with their connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
  /// Writes back everything it reads until the peer closes.
  Echo,
  /// Reads until EOF or error, writing nothing.
  Hold,
  /// Returns immediately.
  Immediate,
  /// Returns an error without touching the socket.
  Fail,
  Panic,
  /// Sleeps without touching the socket, ignoring forced closes.
  Sleep(Duration),
}

/// A handler source that counts acquisitions and releases.
#[derive(Debug)]
pub struct CountingSource {
  behavior: Behavior,
  acquired: AtomicUsize,
  released: AtomicUsize,
  handled: Arc<AtomicUsize>,
}

impl CountingSource {
  pub fn new(behavior: Behavior) -> Arc<Self> {
    Arc::new(Self {
      behavior,
      acquired: AtomicUsize::new(0),
      released: AtomicUsize::new(0),
      handled: Arc::new(AtomicUsize::new(0)),
    })
  }

  pub fn acquired(&self) -> usize {
    self.acquired.load(Ordering::SeqCst)
  }

  pub fn released(&self) -> usize {
    self.released.load(Ordering::SeqCst)
  }

  /// Handler calls that reached their end (not counting panics).
  pub fn handled(&self) -> usize {
    self.handled.load(Ordering::SeqCst)
  }
}

impl HandlerSource for CountingSource {
  fn acquire(&self) -> Result<Box<dyn ConnectionHandler>, ConnError> {
    self.acquired.fetch_add(1, Ordering::SeqCst);
    let behavior = self.behavior;
    let handled = self.handled.clone();
    Ok(Box::new(move |conn: &mut Connection| -> Result<(), ConnError> {
      let result = run_behavior(behavior, conn);
      handled.fetch_add(1, Ordering::SeqCst);
      result
    }))
  }

  fn release(&self, handler: Box<dyn ConnectionHandler>) {
    self.released.fetch_add(1, Ordering::SeqCst);
    drop(handler);
  }
}

fn run_behavior(behavior: Behavior, conn: &mut Connection) -> Result<(), ConnError> {
  match behavior {
    Behavior::Echo => {
      let mut buf = [0u8; 1024];
      loop {
        let n = conn.read(&mut buf)?;
        if n == 0 {
          return Ok(());
        }
        conn.write_all(&buf[..n])?;
      }
    }
    Behavior::Hold => {
      let mut buf = [0u8; 256];
      while conn.read(&mut buf)? > 0 {}
      Ok(())
    }
    Behavior::Immediate => Ok(()),
    Behavior::Fail => Err(ConnError::HandlerFailed("injected handler failure".into())),
    Behavior::Panic => panic!("injected handler panic"),
    Behavior::Sleep(d) => {
      thread::sleep(d);
      Ok(())
    }
  }
}

/// State shared between a `TrackedSocket` and the test that created it.
#[derive(Debug)]
pub struct TrackedShared {
  pub socket: TcpListenSocket,
  pub close_calls: AtomicUsize,
  fail_close: bool,
}

/// A TCP listen socket the test can still inspect after handing it over,
/// optionally reporting a failure from `close`.
#[derive(Debug)]
pub struct TrackedSocket {
  shared: Arc<TrackedShared>,
}

impl TrackedSocket {
  pub fn bind(fail_close: bool) -> (Self, Arc<TrackedShared>) {
    let socket = raccept::bind_tcp("127.0.0.1:0", 32).expect("bind tracked socket");
    let shared = Arc::new(TrackedShared {
      socket,
      close_calls: AtomicUsize::new(0),
      fail_close,
    });
    (Self { shared: shared.clone() }, shared)
  }
}

impl ListenSocket for TrackedSocket {
  fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
    self.shared.socket.accept()
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    self.shared.socket.local_addr()
  }

  fn accept_timeout(&self) -> io::Result<Option<Duration>> {
    self.shared.socket.accept_timeout()
  }

  fn set_accept_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    self.shared.socket.set_accept_timeout(timeout)
  }

  fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
    self.shared.socket.set_nonblocking(nonblocking)
  }

  fn interrupt(&self) -> io::Result<()> {
    self.shared.socket.interrupt()
  }

  fn close(&self) -> io::Result<()> {
    self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
    self.shared.socket.close()?;
    if self.shared.fail_close {
      return Err(io::Error::new(io::ErrorKind::Other, "injected close failure"));
    }
    Ok(())
  }

  fn is_closed(&self) -> bool {
    self.shared.socket.is_closed()
  }

  fn raw_fd(&self) -> Option<RawFd> {
    self.shared.socket.raw_fd()
  }
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  loop {
    if cond() {
      return true;
    }
    if Instant::now() >= deadline {
      return false;
    }
    thread::sleep(Duration::from_millis(5));
  }
}

/// Drains whatever the monitor has queued so far.
pub fn drain_events(rx: &MonitorReceiver) -> Vec<ConnectionEvent> {
  let mut events = Vec::new();
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }
  events
}

/// Waits for the first event matching `pred`, discarding the others.
pub fn wait_for_event(
  rx: &MonitorReceiver,
  timeout: Duration,
  mut pred: impl FnMut(&ConnectionEvent) -> bool,
) -> Option<ConnectionEvent> {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    match rx.try_recv() {
      Ok(event) if pred(&event) => return Some(event),
      Ok(_) => continue,
      Err(_) => thread::sleep(Duration::from_millis(5)),
    }
  }
  None
}

pub fn connect_client(addr: SocketAddr) -> TcpStream {
  let stream = TcpStream::connect(addr).expect("client connect");
  stream.set_read_timeout(Some(LONG_TIMEOUT)).expect("client read timeout");
  stream
}

/// Sends `payload` and reads the same number of bytes back.
pub fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
  stream.write_all(payload).expect("client write");
  let mut buf = vec![0u8; payload.len()];
  stream.read_exact(&mut buf).expect("client read");
  buf
}

/// True once the server side has closed: a read yields EOF or a reset.
pub fn is_closed_by_server(stream: &mut TcpStream) -> bool {
  let mut buf = [0u8; 16];
  match stream.read(&mut buf) {
    Ok(0) => true,
    Ok(_) => false,
    Err(e) => matches!(
      e.kind(),
      io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    ),
  }
}

/// A TCP listen socket whose first `failures` accepts report `ConnectionAborted`
/// before the real accept is attempted.
#[derive(Debug)]
pub struct FlakySocket {
  socket: TcpListenSocket,
  failures_left: AtomicUsize,
}

impl FlakySocket {
  pub fn bind(failures: usize) -> Self {
    Self {
      socket: raccept::bind_tcp("127.0.0.1:0", 32).expect("bind flaky socket"),
      failures_left: AtomicUsize::new(failures),
    }
  }
}

impl ListenSocket for FlakySocket {
  fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
    let injected = self
      .failures_left
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if injected {
      return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "injected accept failure"));
    }
    self.socket.accept()
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    self.socket.local_addr()
  }

  fn accept_timeout(&self) -> io::Result<Option<Duration>> {
    self.socket.accept_timeout()
  }

  fn set_accept_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    self.socket.set_accept_timeout(timeout)
  }

  fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
    self.socket.set_nonblocking(nonblocking)
  }

  fn interrupt(&self) -> io::Result<()> {
    self.socket.interrupt()
  }

  fn close(&self) -> io::Result<()> {
    self.socket.close()
  }

  fn is_closed(&self) -> bool {
    self.socket.is_closed()
  }

  fn raw_fd(&self) -> Option<RawFd> {
    self.socket.raw_fd()
  }
}
