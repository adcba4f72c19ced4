// src/acceptor/blocking.rs

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::acceptor::lifecycle::{ListenerCore, StopRequest};
use crate::acceptor::{Acceptor, AcceptorConfig};
use crate::error::ConnError;
use crate::monitor::{ConnectionEvent, Monitor};
use crate::options::{DEFAULT_ACCEPT_TIMEOUT, DEFAULT_FORCE_GRACE};
use crate::runtime::{deadline_after, AcceptorState, ThreadPool};
use crate::transport::{is_accept_timeout, ListenSocket};

/// Pause after an unexpected accept error so a persistent failure
/// (EMFILE and friends) does not spin the thread.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);
/// Added on top of the accept timeout when waiting for the loop to notice STOPPING.
const STOP_SLACK: Duration = Duration::from_millis(500);

struct AcceptShared {
  core: Arc<ListenerCore>,
  listen: Box<dyn ListenSocket>,
}

/// One listening socket served by one blocking accept loop.
pub struct ConnectionAcceptor {
  shared: Arc<AcceptShared>,
  accept_thread: Mutex<Option<JoinHandle<()>>>,
  force_grace: Duration,
}

impl ConnectionAcceptor {
  pub fn new(config: AcceptorConfig, monitor: Arc<dyn Monitor>) -> Self {
    let (name, listen, source) = config.into_parts();
    Self {
      shared: Arc::new(AcceptShared {
        core: Arc::new(ListenerCore::new(&name, source, monitor)),
        listen,
      }),
      accept_thread: Mutex::new(None),
      force_grace: DEFAULT_FORCE_GRACE,
    }
  }

  /// How long `close` waits for runners after force-closing their sockets.
  pub fn with_force_grace(mut self, grace: Duration) -> Self {
    self.force_grace = grace;
    self
  }

  /// Upper bound on how long the accept loop can take to see a stop request.
  fn stop_bound(&self) -> Duration {
    let accept_timeout = match self.shared.listen.accept_timeout() {
      Ok(Some(t)) => t,
      _ => DEFAULT_ACCEPT_TIMEOUT,
    };
    accept_timeout + ACCEPT_ERROR_BACKOFF + STOP_SLACK
  }

  fn join_accept_thread(&self) -> Result<(), ConnError> {
    let handle = self.accept_thread.lock().take();
    let Some(handle) = handle else {
      return Ok(());
    };
    if handle.thread().id() == thread::current().id() {
      return Ok(());
    }
    handle
      .join()
      .map_err(|_| ConnError::Internal(format!("accept thread of '{}' panicked", self.shared.core.name())))
  }

  /// Waits for runners, then escalates to a forced close when asked to.
  fn drain(&self, started: Instant, wait_timeout: Duration, force_shutdown: bool) {
    drain_runners(&self.shared.core, started, wait_timeout, force_shutdown, self.force_grace);
  }
}

/// Shared by both realizations: graceful wait, then force, then abandon.
pub(crate) fn drain_runners(
  core: &ListenerCore,
  started: Instant,
  wait_timeout: Duration,
  force_shutdown: bool,
  force_grace: Duration,
) {
  let graceful_deadline = started.checked_add(wait_timeout).unwrap_or_else(|| deadline_after(wait_timeout));
  if core.wait_drained(graceful_deadline) {
    return;
  }
  if !force_shutdown {
    tracing::warn!(
      name = %core.name(),
      live = core.live_count(),
      "Graceful shutdown timed out; leaving live connections to finish on their own"
    );
    return;
  }
  core.force_close_runners();
  if core.wait_drained(deadline_after(force_grace)) {
    return;
  }
  core.abandon_runners();
}

impl Acceptor for ConnectionAcceptor {
  fn name(&self) -> &str {
    self.shared.core.name()
  }

  fn start(&self, pool: Option<Arc<dyn ThreadPool>>) -> Result<(), ConnError> {
    let core = &self.shared.core;
    core.start(pool.clone())?;

    let local_addr = self.shared.listen.local_addr().map(|a| a.to_string()).unwrap_or_default();
    tracing::info!(name = %core.name(), %local_addr, "Acceptor listening");
    core.notify(ConnectionEvent::Listening {
      name: core.name().to_string(),
      local_addr,
    });

    let shared = self.shared.clone();
    let launched = match pool {
      Some(pool) => pool.execute(Box::new(move || accept_loop(shared))),
      None => thread::Builder::new()
        .name(format!("{}-accept", core.name()))
        .spawn(move || accept_loop(shared))
        .map(|handle| {
          *self.accept_thread.lock() = Some(handle);
        })
        .map_err(ConnError::from),
    };

    if let Err(e) = launched {
      tracing::error!(name = %core.name(), "Failed to launch accept loop: {}", e);
      // The loop never ran, so its exit guard never will either.
      core.begin_stop();
      close_listen_socket(core, self.shared.listen.as_ref());
      core.mark_stopped();
      return Err(e);
    }
    Ok(())
  }

  fn close(&self, wait_timeout: Duration, force_shutdown: bool) -> Result<(), ConnError> {
    let started = Instant::now();
    let core = &self.shared.core;
    match core.begin_stop() {
      StopRequest::AlreadyStopped => return Ok(()),
      StopRequest::NeverStarted => {
        tracing::debug!(name = %core.name(), "Closing acceptor that was never started");
        close_listen_socket(core, self.shared.listen.as_ref());
        core.mark_stopped();
        return Ok(());
      }
      StopRequest::AlreadyStopping => {
        core.wait_stopped(deadline_after(self.stop_bound()));
        return Ok(());
      }
      StopRequest::Stopping => {}
    }

    tracing::info!(name = %core.name(), ?wait_timeout, force_shutdown, "Closing acceptor");
    if let Err(e) = self.shared.listen.interrupt() {
      // Not every platform can wake a blocked accept; the accept timeout still bounds it.
      tracing::trace!(name = %core.name(), "Listen socket interrupt unavailable: {}", e);
    }

    if !core.wait_stopped(deadline_after(self.stop_bound())) {
      tracing::error!(name = %core.name(), "Accept loop did not stop in time");
      self.drain(started, wait_timeout, force_shutdown);
      return Err(ConnError::ShutdownIncomplete {
        name: core.name().to_string(),
        remaining: core.live_count(),
      });
    }
    self.join_accept_thread()?;

    self.drain(started, wait_timeout, force_shutdown);
    tracing::info!(name = %core.name(), "Acceptor closed");
    Ok(())
  }

  fn state(&self) -> AcceptorState {
    self.shared.core.state()
  }

  fn live_connections(&self) -> usize {
    self.shared.core.live_count()
  }

  fn local_addr(&self) -> Option<std::net::SocketAddr> {
    self.shared.listen.local_addr().ok()
  }
}

impl Drop for ConnectionAcceptor {
  fn drop(&mut self) {
    // The accept loop holds its own reference; stop it rather than leak it.
    if self.shared.core.state() < AcceptorState::Stopped {
      if let Err(e) = self.close(Duration::ZERO, true) {
        tracing::warn!(name = %self.shared.core.name(), "Error closing acceptor on drop: {}", e);
      }
    }
  }
}

impl fmt::Debug for ConnectionAcceptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionAcceptor")
      .field("core", &self.shared.core)
      .field("listen", &self.shared.listen)
      .field("force_grace", &self.force_grace)
      .finish()
  }
}

/// Closes the listen socket and moves the core to STOPPED when the accept
/// loop exits, however it exits.
struct AcceptLoopGuard {
  shared: Arc<AcceptShared>,
}

impl Drop for AcceptLoopGuard {
  fn drop(&mut self) {
    let core = &self.shared.core;
    if thread::panicking() {
      tracing::error!(name = %core.name(), "Accept loop panicked");
      core.begin_stop();
    }
    close_listen_socket(core, self.shared.listen.as_ref());
    core.notify(ConnectionEvent::Closed {
      name: core.name().to_string(),
    });
    core.mark_stopped();
    tracing::debug!(name = %core.name(), "Accept loop finished");
  }
}

fn accept_loop(shared: Arc<AcceptShared>) {
  let _guard = AcceptLoopGuard { shared: shared.clone() };
  let core = &shared.core;
  tracing::debug!(name = %core.name(), "Accept loop started");

  while core.is_accepting() {
    match shared.listen.accept() {
      Ok((stream, peer_addr)) => core.dispatch(stream, peer_addr),
      Err(e) if is_accept_timeout(&e) || e.kind() == std::io::ErrorKind::Interrupted => continue,
      Err(e) => {
        if !core.is_accepting() {
          // The interrupt during close surfaces here.
          break;
        }
        tracing::error!(name = %core.name(), "Error accepting connection: {}", e);
        core.notify(ConnectionEvent::AcceptFailed {
          name: core.name().to_string(),
          error_msg: e.to_string(),
        });
        thread::sleep(ACCEPT_ERROR_BACKOFF);
      }
    }
  }
}

pub(crate) fn close_listen_socket(core: &ListenerCore, listen: &dyn ListenSocket) {
  if listen.is_closed() {
    return;
  }
  match listen.close() {
    Ok(()) => tracing::debug!(name = %core.name(), "Listen socket closed"),
    Err(e) => {
      tracing::error!(name = %core.name(), "Failed to close listen socket: {}", e);
      core.notify(ConnectionEvent::CloseFailed {
        name: core.name().to_string(),
        error_msg: e.to_string(),
      });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handler::{Connection, ConnectionHandler, FactoryHandlerSource};
  use crate::monitor::NullMonitor;
  use crate::transport::bind_tcp;
  use std::net::TcpStream;

  fn acceptor(name: &str) -> ConnectionAcceptor {
    let listen = bind_tcp("127.0.0.1:0", 16).unwrap();
    listen.set_accept_timeout(Some(Duration::from_millis(50))).unwrap();
    let source = Arc::new(FactoryHandlerSource::new(|| {
      Box::new(|_conn: &mut Connection| -> Result<(), ConnError> { Ok(()) }) as Box<dyn ConnectionHandler>
    }));
    let config = AcceptorConfig::new(name, Box::new(listen), source).unwrap();
    ConnectionAcceptor::new(config, Arc::new(NullMonitor))
  }

  #[test]
  fn start_twice_is_rejected() {
    let acceptor = acceptor("twice");
    acceptor.start(None).unwrap();
    assert!(acceptor.is_running());
    assert!(matches!(acceptor.start(None), Err(ConnError::InvalidState(_))));
    acceptor.close(Duration::ZERO, false).unwrap();
    assert_eq!(acceptor.state(), AcceptorState::Stopped);
  }

  #[test]
  fn close_before_start_goes_straight_to_stopped() {
    let acceptor = acceptor("never-started");
    acceptor.close(Duration::from_millis(10), true).unwrap();
    assert_eq!(acceptor.state(), AcceptorState::Stopped);
    assert!(acceptor.local_addr().is_none());
    assert!(matches!(acceptor.start(None), Err(ConnError::InvalidState(_))));
  }

  #[test]
  fn close_releases_the_port() {
    let acceptor = acceptor("port");
    acceptor.start(None).unwrap();
    let addr = acceptor.local_addr().unwrap();
    acceptor.close(Duration::ZERO, false).unwrap();
    assert!(acceptor.local_addr().is_none());
    assert!(TcpStream::connect(addr).is_err());
    // Idempotent.
    acceptor.close(Duration::ZERO, false).unwrap();
  }
}
