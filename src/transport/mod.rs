// src/transport/mod.rs

//! Listening sockets as seen by the acceptors.

pub mod tcp;

pub use tcp::{bind_tcp, parse_tcp_endpoint, TcpListenSocket};

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::time::Duration;

/// A server socket an acceptor can accept from, time-bound, wake and close.
///
/// All methods take `&self`: `interrupt` is called from the closing thread
/// while the accept thread may be blocked inside `accept`.
pub trait ListenSocket: Send + Sync + fmt::Debug {
  /// Accepts one pending connection. Times out with `WouldBlock`/`TimedOut`
  /// when an accept timeout is set, or immediately in non-blocking mode.
  fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

  fn local_addr(&self) -> io::Result<SocketAddr>;

  /// Current accept timeout; `None` means accept blocks indefinitely.
  fn accept_timeout(&self) -> io::Result<Option<Duration>>;

  fn set_accept_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

  fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

  /// Wakes a thread blocked in `accept`, where the platform supports it.
  /// Later accepts fail; the socket still has to be closed with `close`.
  fn interrupt(&self) -> io::Result<()>;

  /// Closes the socket, reporting the OS error if the close itself fails.
  /// Closing an already closed socket is a no-op.
  fn close(&self) -> io::Result<()>;

  fn is_closed(&self) -> bool;

  /// Descriptor used for readiness registration; `None` once closed.
  fn raw_fd(&self) -> Option<RawFd>;
}

/// Error returned by operations on a socket that has been closed.
pub(crate) fn closed_socket_error() -> io::Error {
  io::Error::new(io::ErrorKind::NotConnected, "listen socket is closed")
}

/// Accept errors that only mean "nothing yet, look at the state again".
pub(crate) fn is_accept_timeout(e: &io::Error) -> bool {
  matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
