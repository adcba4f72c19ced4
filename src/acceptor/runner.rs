// src/acceptor/runner.rs

use std::any::Any;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::acceptor::lifecycle::ListenerCore;
use crate::handler::{Connection, ConnectionHandler};
use crate::ConnError;

/// The acceptor's handle on a live runner: enough to interrupt it and to close
/// its socket from another thread.
#[derive(Debug)]
pub(crate) struct RunnerControl {
  id: u64,
  peer_addr: SocketAddr,
  /// Duplicate of the runner's stream; shutting it down affects both.
  stream: TcpStream,
  interrupted: Arc<AtomicBool>,
  closed: AtomicBool,
}

impl RunnerControl {
  pub(crate) fn new(id: u64, peer_addr: SocketAddr, stream: TcpStream) -> Self {
    Self {
      id,
      peer_addr,
      stream,
      interrupted: Arc::new(AtomicBool::new(false)),
      closed: AtomicBool::new(false),
    }
  }

  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  pub(crate) fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }

  pub(crate) fn interrupt_flag(&self) -> Arc<AtomicBool> {
    self.interrupted.clone()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Marks the runner interrupted and shuts its socket down in both directions.
  ///
  /// Only the first call touches the socket. A peer that already went away is
  /// not an error.
  pub(crate) fn close(&self) -> io::Result<()> {
    self.interrupted.store(true, Ordering::Release);
    if self.closed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    match self.stream.shutdown(Shutdown::Both) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
      Err(e) => Err(e),
    }
  }
}

/// Drives one accepted connection through its handler.
///
/// Disposal lives in `Drop`: whether `run` returns, the handler errors or
/// panics, or the runner is dropped unrun because the pool refused it, the
/// owner sees exactly one `dispose` with the handler and the connection.
pub(crate) struct ConnectionRunner {
  owner: Arc<ListenerCore>,
  control: Arc<RunnerControl>,
  handler: Option<Box<dyn ConnectionHandler>>,
  connection: Option<Connection>,
}

impl ConnectionRunner {
  pub(crate) fn new(
    owner: Arc<ListenerCore>,
    control: Arc<RunnerControl>,
    handler: Box<dyn ConnectionHandler>,
    connection: Connection,
  ) -> Self {
    Self {
      owner,
      control,
      handler: Some(handler),
      connection: Some(connection),
    }
  }

  pub(crate) fn run(mut self) {
    let span = tracing::debug_span!(
      "connection",
      name = %self.owner.name(),
      runner = self.control.id(),
      peer = %self.control.peer_addr()
    );
    let _enter = span.enter();
    tracing::debug!("Connection runner started");

    let (Some(handler), Some(connection)) = (self.handler.as_mut(), self.connection.as_mut()) else {
      return;
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle_connection(connection)));
    match outcome {
      Ok(Ok(())) => tracing::debug!("Connection handler completed"),
      Ok(Err(e)) => {
        if self.control.is_closed() {
          tracing::debug!(error = %e, "Connection handler failed after forced close");
        } else {
          tracing::warn!(error = %e, "Connection handler failed");
        }
        self.owner.report_handler_error(self.control.peer_addr(), &e);
      }
      Err(payload) => {
        let msg = panic_message(payload.as_ref());
        tracing::error!(panic = %msg, "Connection handler panicked");
        self
          .owner
          .report_handler_error(self.control.peer_addr(), &ConnError::HandlerFailed(format!("panicked: {}", msg)));
      }
    }
  }
}

impl Drop for ConnectionRunner {
  fn drop(&mut self) {
    if let (Some(handler), Some(connection)) = (self.handler.take(), self.connection.take()) {
      self.owner.dispose(&self.control, handler, connection);
    }
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
