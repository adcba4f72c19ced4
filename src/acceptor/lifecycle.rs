// src/acceptor/lifecycle.rs

//! State and live-runner bookkeeping shared by both acceptor realizations.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::acceptor::runner::{ConnectionRunner, RunnerControl};
use crate::error::ConnError;
use crate::handler::{Connection, ConnectionHandler, HandlerSource};
use crate::monitor::{ConnectionEvent, Monitor};
use crate::runtime::{AcceptorState, DedicatedThreads, ThreadPool};

/// Outcome of asking a listener to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopRequest {
  /// Was never started; now STOPPED without having run.
  NeverStarted,
  /// Was RUNNING; this caller owns the shutdown sequence.
  Stopping,
  /// Another caller is already shutting it down.
  AlreadyStopping,
  AlreadyStopped,
}

struct CoreInner {
  state: AcceptorState,
  runners: HashMap<u64, Arc<RunnerControl>>,
  pool: Option<Arc<dyn ThreadPool>>,
}

/// One listener's lifecycle: its state, its live runners and the condition
/// variable `close` waits on. Every field that runner threads, the accept
/// thread and a closing thread all touch lives behind the single `inner` mutex.
pub(crate) struct ListenerCore {
  name: Arc<str>,
  source: Arc<dyn HandlerSource>,
  monitor: Arc<dyn Monitor>,
  inner: Mutex<CoreInner>,
  changed: Condvar,
  next_runner_id: AtomicU64,
}

impl ListenerCore {
  pub(crate) fn new(name: &str, source: Arc<dyn HandlerSource>, monitor: Arc<dyn Monitor>) -> Self {
    Self {
      name: Arc::from(name),
      source,
      monitor,
      inner: Mutex::new(CoreInner {
        state: AcceptorState::Created,
        runners: HashMap::new(),
        pool: None,
      }),
      changed: Condvar::new(),
      next_runner_id: AtomicU64::new(1),
    }
  }

  pub(crate) fn name(&self) -> &str {
    &self.name
  }

  pub(crate) fn state(&self) -> AcceptorState {
    self.inner.lock().state
  }

  pub(crate) fn is_accepting(&self) -> bool {
    self.inner.lock().state.is_running()
  }

  pub(crate) fn live_count(&self) -> usize {
    self.inner.lock().runners.len()
  }

  pub(crate) fn notify(&self, event: ConnectionEvent) {
    self.monitor.on_event(&event);
  }

  /// CREATED -> RUNNING. Runners will execute on `pool`, or on dedicated threads.
  pub(crate) fn start(&self, pool: Option<Arc<dyn ThreadPool>>) -> Result<(), ConnError> {
    let mut inner = self.inner.lock();
    if inner.state != AcceptorState::Created {
      return Err(ConnError::InvalidState("acceptor was already started or closed"));
    }
    let pool: Arc<dyn ThreadPool> = match pool {
      Some(pool) => pool,
      None => Arc::new(DedicatedThreads::new(format!("{}-conn", self.name))),
    };
    inner.pool = Some(pool);
    inner.state.advance(AcceptorState::Running);
    Ok(())
  }

  pub(crate) fn begin_stop(&self) -> StopRequest {
    let mut inner = self.inner.lock();
    let current = inner.state;
    let request = match current {
      AcceptorState::Created => {
        inner.state.advance(AcceptorState::Stopped);
        StopRequest::NeverStarted
      }
      AcceptorState::Running => {
        inner.state.advance(AcceptorState::Stopping);
        StopRequest::Stopping
      }
      AcceptorState::Stopping => StopRequest::AlreadyStopping,
      AcceptorState::Stopped => StopRequest::AlreadyStopped,
    };
    self.changed.notify_all();
    request
  }

  /// Final transition, made once the accept side has let go of the listen socket.
  pub(crate) fn mark_stopped(&self) {
    let mut inner = self.inner.lock();
    inner.state.advance(AcceptorState::Stopped);
    self.changed.notify_all();
  }

  /// Waits until STOPPED or `deadline`. Returns whether STOPPED was reached.
  pub(crate) fn wait_stopped(&self, deadline: Instant) -> bool {
    let mut inner = self.inner.lock();
    while inner.state != AcceptorState::Stopped {
      if self.changed.wait_until(&mut inner, deadline).timed_out() {
        return inner.state == AcceptorState::Stopped;
      }
    }
    true
  }

  /// Waits until no runner is live or `deadline`. Returns whether the set drained.
  pub(crate) fn wait_drained(&self, deadline: Instant) -> bool {
    let mut inner = self.inner.lock();
    while !inner.runners.is_empty() {
      tracing::trace!(name = %self.name, live = inner.runners.len(), "Waiting for live runners to drain");
      if self.changed.wait_until(&mut inner, deadline).timed_out() {
        return inner.runners.is_empty();
      }
    }
    true
  }

  /// Closes the socket of every live runner. Runners stay in the live set
  /// until their own disposal removes them.
  pub(crate) fn force_close_runners(&self) -> usize {
    let controls: Vec<Arc<RunnerControl>> = self.inner.lock().runners.values().cloned().collect();
    if controls.is_empty() {
      return 0;
    }
    tracing::warn!(name = %self.name, runners = controls.len(), "Forcing live connections closed");
    for control in &controls {
      if let Err(e) = control.close() {
        tracing::error!(name = %self.name, runner = control.id(), "Failed to close connection: {}", e);
        self.notify(ConnectionEvent::CloseFailed {
          name: self.name.to_string(),
          error_msg: e.to_string(),
        });
      }
    }
    self.notify(ConnectionEvent::ForcedShutdown {
      name: self.name.to_string(),
      runners: controls.len(),
    });
    controls.len()
  }

  /// Drops every remaining runner from the live set without waiting for it.
  /// Their later disposal still releases the handler, then reports a double dispose.
  pub(crate) fn abandon_runners(&self) -> usize {
    let mut inner = self.inner.lock();
    let n = inner.runners.len();
    if n > 0 {
      tracing::warn!(name = %self.name, runners = n, "Abandoning runners that outlived forced shutdown");
      inner.runners.clear();
      self.changed.notify_all();
    }
    n
  }

  /// Hands one accepted connection to a new runner.
  ///
  /// Called from the accept thread. Every failure here ends with the stream
  /// closed and, if one was acquired, the handler released.
  pub(crate) fn dispatch(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
    if !self.is_accepting() {
      tracing::debug!(name = %self.name, peer = %peer_addr, "Connection accepted during shutdown, closing it");
      close_quietly(&stream);
      return;
    }
    tracing::debug!(name = %self.name, peer = %peer_addr, "Accepted new connection");
    self.notify(ConnectionEvent::Accepted {
      name: self.name.to_string(),
      peer_addr: peer_addr.to_string(),
    });

    if let Err(e) = prepare_accepted_stream(&stream) {
      tracing::error!(name = %self.name, peer = %peer_addr, "Failed to prepare accepted stream: {}", e);
      self.notify(ConnectionEvent::AcceptFailed {
        name: self.name.to_string(),
        error_msg: e.to_string(),
      });
      close_quietly(&stream);
      return;
    }

    let handler = match self.source.acquire() {
      Ok(handler) => handler,
      Err(e) => {
        tracing::error!(name = %self.name, peer = %peer_addr, "Failed to acquire connection handler: {}", e);
        self.notify(ConnectionEvent::AcquireFailed {
          name: self.name.to_string(),
          peer_addr: peer_addr.to_string(),
          error_msg: e.to_string(),
        });
        close_quietly(&stream);
        return;
      }
    };

    let control_stream = match stream.try_clone() {
      Ok(s) => s,
      Err(e) => {
        tracing::error!(name = %self.name, peer = %peer_addr, "Failed to duplicate accepted stream: {}", e);
        self.source.release(handler);
        self.notify(ConnectionEvent::AcceptFailed {
          name: self.name.to_string(),
          error_msg: e.to_string(),
        });
        close_quietly(&stream);
        return;
      }
    };

    let id = self.next_runner_id.fetch_add(1, Ordering::Relaxed);
    let control = Arc::new(RunnerControl::new(id, peer_addr, control_stream));

    // Registered before dispatch so `close` can never miss it.
    let pool = {
      let mut inner = self.inner.lock();
      if !inner.state.is_running() {
        drop(inner);
        tracing::debug!(name = %self.name, peer = %peer_addr, "Shutdown began during dispatch, dropping connection");
        self.source.release(handler);
        close_quietly(&stream);
        return;
      }
      inner.runners.insert(id, control.clone());
      inner.pool.clone()
    };
    let Some(pool) = pool else {
      // start() always installs a pool before RUNNING; keep the books straight regardless.
      self.remove_runner(id);
      self.source.release(handler);
      close_quietly(&stream);
      return;
    };

    let connection = Connection::new(stream, peer_addr, self.name.clone(), control.interrupt_flag());
    let runner = ConnectionRunner::new(self.clone(), control, handler, connection);
    if let Err(e) = pool.execute(Box::new(move || runner.run())) {
      // The rejected task, and with it the runner, has already been dropped and disposed.
      tracing::error!(name = %self.name, peer = %peer_addr, "Failed to dispatch connection runner: {}", e);
      self.notify(ConnectionEvent::DispatchFailed {
        name: self.name.to_string(),
        error_msg: e.to_string(),
      });
    }
  }

  pub(crate) fn report_handler_error(&self, peer_addr: SocketAddr, error: &ConnError) {
    self.notify(ConnectionEvent::HandlerFailed {
      name: self.name.to_string(),
      peer_addr: peer_addr.to_string(),
      error_msg: error.to_string(),
    });
  }

  /// Reclaims a finished runner: releases its handler, closes its connection,
  /// then removes it from the live set and wakes `close`.
  pub(crate) fn dispose(
    &self,
    control: &RunnerControl,
    handler: Box<dyn ConnectionHandler>,
    connection: Connection,
  ) {
    self.source.release(handler);

    if let Err(e) = control.close() {
      tracing::warn!(name = %self.name, runner = control.id(), "Failed to close connection: {}", e);
      self.notify(ConnectionEvent::CloseFailed {
        name: self.name.to_string(),
        error_msg: e.to_string(),
      });
    }
    drop(connection);
    self.notify(ConnectionEvent::Disconnected {
      name: self.name.to_string(),
      peer_addr: control.peer_addr().to_string(),
    });

    if !self.remove_runner(control.id()) {
      tracing::debug!(name = %self.name, runner = control.id(), "Runner already removed from live set");
      self.notify(ConnectionEvent::DoubleDispose {
        name: self.name.to_string(),
        runner_id: control.id(),
      });
    }
  }

  fn remove_runner(&self, id: u64) -> bool {
    let mut inner = self.inner.lock();
    let removed = inner.runners.remove(&id).is_some();
    self.changed.notify_all();
    removed
  }
}

impl fmt::Debug for ListenerCore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("ListenerCore")
      .field("name", &self.name)
      .field("state", &inner.state)
      .field("live_runners", &inner.runners.len())
      .finish()
  }
}

/// Undoes listener settings an accepted socket may inherit: non-blocking mode
/// (BSD) and the accept timeout (SO_RCVTIMEO on Linux).
fn prepare_accepted_stream(stream: &TcpStream) -> io::Result<()> {
  stream.set_nonblocking(false)?;
  stream.set_read_timeout(None)
}

fn close_quietly(stream: &TcpStream) {
  if let Err(e) = stream.shutdown(Shutdown::Both) {
    if e.kind() != io::ErrorKind::NotConnected {
      tracing::trace!("Ignoring shutdown error on dropped connection: {}", e);
    }
  }
}
