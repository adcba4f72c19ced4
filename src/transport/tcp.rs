// src/transport/tcp.rs

use crate::error::ConnError;
use crate::transport::{closed_socket_error, ListenSocket};

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use parking_lot::RwLock;
use socket2::SockRef;

/// A `std::net::TcpListener` behind the `ListenSocket` interface.
///
/// `accept` holds a shared lock for the duration of the call so `close`
/// (exclusive) can never release the descriptor under a pending accept.
#[derive(Debug)]
pub struct TcpListenSocket {
  inner: RwLock<Option<TcpListener>>,
}

impl TcpListenSocket {
  pub fn new(listener: TcpListener) -> Self {
    Self {
      inner: RwLock::new(Some(listener)),
    }
  }

  fn with_listener<T>(&self, f: impl FnOnce(&TcpListener) -> io::Result<T>) -> io::Result<T> {
    let guard = self.inner.read();
    match guard.as_ref() {
      Some(listener) => f(listener),
      None => Err(closed_socket_error()),
    }
  }
}

impl From<TcpListener> for TcpListenSocket {
  fn from(listener: TcpListener) -> Self {
    Self::new(listener)
  }
}

impl ListenSocket for TcpListenSocket {
  fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
    self.with_listener(|l| l.accept())
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    self.with_listener(|l| l.local_addr())
  }

  fn accept_timeout(&self) -> io::Result<Option<Duration>> {
    // SO_RCVTIMEO bounds accept() as well as reads.
    self.with_listener(|l| SockRef::from(l).read_timeout())
  }

  fn set_accept_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    self.with_listener(|l| SockRef::from(l).set_read_timeout(timeout))
  }

  fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
    self.with_listener(|l| l.set_nonblocking(nonblocking))
  }

  fn interrupt(&self) -> io::Result<()> {
    // On Linux this wakes a blocked accept() with EINVAL. Elsewhere it may be
    // refused, and the accept timeout bounds the wait instead.
    self.with_listener(|l| SockRef::from(l).shutdown(Shutdown::Read))
  }

  fn close(&self) -> io::Result<()> {
    let Some(listener) = self.inner.write().take() else {
      return Ok(());
    };
    let fd: OwnedFd = listener.into();
    let raw = fd.into_raw_fd();
    // SAFETY: `raw` was released from an OwnedFd above and is closed exactly once here.
    if unsafe { libc::close(raw) } == -1 {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }

  fn is_closed(&self) -> bool {
    self.inner.read().is_none()
  }

  fn raw_fd(&self) -> Option<RawFd> {
    self.inner.read().as_ref().map(|l| l.as_raw_fd())
  }
}

/// Parses `tcp://host:port` or a bare `host:port` into a socket address.
pub fn parse_tcp_endpoint(endpoint: &str) -> Result<SocketAddr, ConnError> {
  let addr_part = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
  addr_part.parse::<SocketAddr>().map_err(|e| {
    tracing::debug!("Failed to parse TCP address: {}", addr_part);
    ConnError::InvalidArgument(format!("invalid TCP endpoint '{}': {}", endpoint, e))
  })
}

/// Binds a reusable TCP listener on `endpoint` with the given backlog.
pub fn bind_tcp(endpoint: &str, backlog: i32) -> Result<TcpListenSocket, ConnError> {
  let addr = parse_tcp_endpoint(endpoint)?;
  let domain = if addr.is_ipv4() {
    socket2::Domain::IPV4
  } else {
    socket2::Domain::IPV6
  };
  let socket = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
  socket.set_reuse_address(true)?;
  socket
    .bind(&addr.into())
    .map_err(|e| ConnError::from_io_endpoint(e, endpoint))?;
  socket.listen(backlog)?;

  let listener: TcpListener = socket.into();
  if let Ok(bound) = listener.local_addr() {
    tracing::info!(local_addr = %bound, requested = %endpoint, "TCP listener bound successfully");
  }
  Ok(TcpListenSocket::new(listener))
}
