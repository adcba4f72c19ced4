// src/handler.rs

//! Connection handlers and the sources that hand them out.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ConnError;

/// A live accepted connection, lent to a handler for one `handle_connection` call.
pub struct Connection {
  stream: TcpStream,
  peer_addr: SocketAddr,
  acceptor_name: Arc<str>,
  interrupted: Arc<AtomicBool>,
}

impl Connection {
  pub(crate) fn new(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor_name: Arc<str>,
    interrupted: Arc<AtomicBool>,
  ) -> Self {
    Self {
      stream,
      peer_addr,
      acceptor_name,
      interrupted,
    }
  }

  pub fn stream(&self) -> &TcpStream {
    &self.stream
  }

  pub fn stream_mut(&mut self) -> &mut TcpStream {
    &mut self.stream
  }

  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }

  /// Name of the acceptor that accepted this connection.
  pub fn acceptor_name(&self) -> &str {
    &self.acceptor_name
  }

  /// Set once the owning acceptor asked this connection to stop.
  ///
  /// Long-running handlers that do not block on the socket should poll this
  /// and return early; blocked socket calls are woken by the forced close.
  pub fn is_interrupted(&self) -> bool {
    self.interrupted.load(Ordering::Acquire)
  }
}

impl fmt::Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connection")
      .field("peer_addr", &self.peer_addr)
      .field("acceptor", &self.acceptor_name)
      .field("interrupted", &self.is_interrupted())
      .finish()
  }
}

impl Read for Connection {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.stream.read(buf)
  }
}

impl Write for Connection {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.stream.write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.stream.flush()
  }
}

/// The unit of work executed against one accepted connection.
///
/// The connection is only borrowed; it is closed by the runner once the call returns.
pub trait ConnectionHandler: Send {
  fn handle_connection(&mut self, connection: &mut Connection) -> Result<(), ConnError>;
}

impl<F> ConnectionHandler for F
where
  F: FnMut(&mut Connection) -> Result<(), ConnError> + Send,
{
  fn handle_connection(&mut self, connection: &mut Connection) -> Result<(), ConnError> {
    self(connection)
  }
}

/// Supplier of handler instances with acquire/release semantics.
///
/// `acquire` may be called concurrently from several acceptors.
pub trait HandlerSource: Send + Sync {
  fn acquire(&self) -> Result<Box<dyn ConnectionHandler>, ConnError>;
  fn release(&self, handler: Box<dyn ConnectionHandler>);
}

type HandlerFactory = dyn Fn() -> Box<dyn ConnectionHandler> + Send + Sync;

/// Builds a fresh handler for every connection; released handlers are dropped.
pub struct FactoryHandlerSource {
  factory: Box<HandlerFactory>,
}

impl FactoryHandlerSource {
  pub fn new<F>(factory: F) -> Self
  where
    F: Fn() -> Box<dyn ConnectionHandler> + Send + Sync + 'static,
  {
    Self {
      factory: Box::new(factory),
    }
  }
}

impl fmt::Debug for FactoryHandlerSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FactoryHandlerSource").finish_non_exhaustive()
  }
}

impl HandlerSource for FactoryHandlerSource {
  fn acquire(&self) -> Result<Box<dyn ConnectionHandler>, ConnError> {
    Ok((self.factory)())
  }

  fn release(&self, handler: Box<dyn ConnectionHandler>) {
    drop(handler);
  }
}

#[derive(Default)]
struct PoolState {
  idle: Vec<Box<dyn ConnectionHandler>>,
  in_use: usize,
}

/// A bounded pool of reusable handlers.
///
/// At most `max_handlers` handlers are handed out at once; further acquisitions
/// fail with `ConnError::PoolExhausted` until one is released.
pub struct PooledHandlerSource {
  factory: Box<HandlerFactory>,
  max_handlers: usize,
  state: Mutex<PoolState>,
}

impl PooledHandlerSource {
  pub fn new<F>(max_handlers: usize, factory: F) -> Self
  where
    F: Fn() -> Box<dyn ConnectionHandler> + Send + Sync + 'static,
  {
    Self {
      factory: Box::new(factory),
      max_handlers: max_handlers.max(1),
      state: Mutex::new(PoolState::default()),
    }
  }

  pub fn max_handlers(&self) -> usize {
    self.max_handlers
  }

  pub fn in_use(&self) -> usize {
    self.state.lock().in_use
  }

  pub fn idle(&self) -> usize {
    self.state.lock().idle.len()
  }
}

impl fmt::Debug for PooledHandlerSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("PooledHandlerSource")
      .field("max_handlers", &self.max_handlers)
      .field("in_use", &state.in_use)
      .field("idle", &state.idle.len())
      .finish()
  }
}

impl HandlerSource for PooledHandlerSource {
  fn acquire(&self) -> Result<Box<dyn ConnectionHandler>, ConnError> {
    {
      let mut state = self.state.lock();
      if let Some(handler) = state.idle.pop() {
        state.in_use += 1;
        return Ok(handler);
      }
      if state.in_use >= self.max_handlers {
        tracing::debug!(in_use = state.in_use, max = self.max_handlers, "Handler pool exhausted");
        return Err(ConnError::PoolExhausted(state.in_use));
      }
      // Reserve the slot before building outside the lock.
      state.in_use += 1;
    }
    Ok((self.factory)())
  }

  fn release(&self, handler: Box<dyn ConnectionHandler>) {
    let mut state = self.state.lock();
    if state.in_use == 0 {
      tracing::warn!("Handler released to a pool with no outstanding handlers; dropping it");
      return;
    }
    state.in_use -= 1;
    if state.idle.len() < self.max_handlers {
      state.idle.push(handler);
    }
  }
}
