// src/acceptor/multiplexed.rs

//! Many listening sockets served by one readiness-selection loop.
//!
//! Each `MultiplexedListener` keeps the lifecycle contract of a blocking
//! `ConnectionAcceptor` (its own state, live runners and shutdown sequence);
//! only the accept side is shared. Listeners are (de)registered with the
//! selector while the loop runs.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Condvar, Mutex};

use crate::acceptor::blocking::{close_listen_socket, drain_runners};
use crate::acceptor::lifecycle::{ListenerCore, StopRequest};
use crate::acceptor::{Acceptor, AcceptorConfig};
use crate::error::ConnError;
use crate::monitor::{ConnectionEvent, Monitor};
use crate::options::{DEFAULT_ACCEPT_TIMEOUT, DEFAULT_FORCE_GRACE, DEFAULT_POLL_CAPACITY};
use crate::runtime::{deadline_after, AcceptorState, ThreadPool};
use crate::transport::{is_accept_timeout, ListenSocket};

const WAKER_TOKEN: Token = Token(0);
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(50);
/// Consecutive accept errors on one listener before it is re-armed and left for the next poll.
const MAX_ACCEPT_RETRIES: usize = 8;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const STOP_SLACK: Duration = Duration::from_millis(500);

struct MuxInner {
  state: AcceptorState,
  by_name: HashMap<String, Token>,
  by_token: HashMap<Token, Arc<MultiplexedListener>>,
  next_token: usize,
}

struct MuxShared {
  name: Arc<str>,
  registry: Registry,
  waker: Waker,
  monitor: Arc<dyn Monitor>,
  inner: Mutex<MuxInner>,
  changed: Condvar,
  poll_capacity: usize,
  /// Upper bound on one `poll` call; the loop re-checks its state at least this often.
  poll_timeout: Duration,
  force_grace: Duration,
}

impl MuxShared {
  fn state(&self) -> AcceptorState {
    self.inner.lock().state
  }

  fn listener_for(&self, token: Token) -> Option<Arc<MultiplexedListener>> {
    self.inner.lock().by_token.get(&token).cloned()
  }

  /// Removes a listener from both maps; harmless if it is already gone.
  fn detach(&self, name: &str, token: Token) {
    let mut inner = self.inner.lock();
    if inner.by_name.get(name) == Some(&token) {
      inner.by_name.remove(name);
    }
    inner.by_token.remove(&token);
  }

  fn mark_stopped(&self) {
    let mut inner = self.inner.lock();
    inner.state.advance(AcceptorState::Stopped);
    self.changed.notify_all();
  }

  fn wait_stopped(&self, deadline: Instant) -> bool {
    let mut inner = self.inner.lock();
    while inner.state != AcceptorState::Stopped {
      if self.changed.wait_until(&mut inner, deadline).timed_out() {
        return inner.state == AcceptorState::Stopped;
      }
    }
    true
  }
}

/// The shared selection loop and the registry of its listeners.
pub struct MultiplexedAcceptor {
  shared: Arc<MuxShared>,
  poll: Mutex<Option<Poll>>,
  loop_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MultiplexedAcceptor {
  pub fn new(name: impl Into<String>, monitor: Arc<dyn Monitor>) -> Result<Self, ConnError> {
    Self::with_settings(name, monitor, DEFAULT_POLL_CAPACITY, DEFAULT_FORCE_GRACE)
  }

  pub fn with_settings(
    name: impl Into<String>,
    monitor: Arc<dyn Monitor>,
    poll_capacity: usize,
    force_grace: Duration,
  ) -> Result<Self, ConnError> {
    let name = name.into();
    if name.trim().is_empty() {
      return Err(ConnError::InvalidArgument("acceptor name must not be empty".into()));
    }
    let poll = Poll::new()?;
    let registry = poll.registry().try_clone()?;
    let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
    Ok(Self {
      shared: Arc::new(MuxShared {
        name: Arc::from(name),
        registry,
        waker,
        monitor,
        inner: Mutex::new(MuxInner {
          state: AcceptorState::Created,
          by_name: HashMap::new(),
          by_token: HashMap::new(),
          next_token: WAKER_TOKEN.0 + 1,
        }),
        changed: Condvar::new(),
        poll_capacity: poll_capacity.max(1),
        poll_timeout: DEFAULT_ACCEPT_TIMEOUT,
        force_grace,
      }),
      poll: Mutex::new(Some(poll)),
      loop_thread: Mutex::new(None),
    })
  }

  /// Adds a listener under `config.name()`. The listener is CREATED; its
  /// socket joins the selector when the listener is started.
  pub fn register(&self, config: AcceptorConfig) -> Result<Arc<MultiplexedListener>, ConnError> {
    let (name, listen, source) = config.into_parts();
    let mut inner = self.shared.inner.lock();
    if inner.state > AcceptorState::Running {
      return Err(ConnError::InvalidState("multiplexed acceptor is shutting down"));
    }
    if inner.by_name.contains_key(&name) {
      return Err(ConnError::DuplicateName(name));
    }
    let token = Token(inner.next_token);
    inner.next_token += 1;

    let listener = Arc::new(MultiplexedListener {
      core: Arc::new(ListenerCore::new(&name, source, self.shared.monitor.clone())),
      listen,
      token,
      mux: Arc::downgrade(&self.shared),
      force_grace: self.shared.force_grace,
    });
    inner.by_name.insert(name, token);
    inner.by_token.insert(token, listener.clone());
    tracing::debug!(mux = %self.shared.name, name = %listener.name(), token = token.0, "Listener registered");
    Ok(listener)
  }

  pub fn listener(&self, name: &str) -> Option<Arc<MultiplexedListener>> {
    let inner = self.shared.inner.lock();
    inner.by_name.get(name).and_then(|t| inner.by_token.get(t)).cloned()
  }

  pub fn listener_count(&self) -> usize {
    self.shared.inner.lock().by_token.len()
  }

  fn join_loop_thread(&self) -> Result<(), ConnError> {
    let Some(handle) = self.loop_thread.lock().take() else {
      return Ok(());
    };
    if handle.thread().id() == thread::current().id() {
      return Ok(());
    }
    handle
      .join()
      .map_err(|_| ConnError::Internal(format!("selection loop of '{}' panicked", self.shared.name)))
  }
}

impl Acceptor for MultiplexedAcceptor {
  fn name(&self) -> &str {
    &self.shared.name
  }

  /// Starts the selection loop. Listeners are started individually.
  fn start(&self, pool: Option<Arc<dyn ThreadPool>>) -> Result<(), ConnError> {
    {
      let mut inner = self.shared.inner.lock();
      if inner.state != AcceptorState::Created {
        return Err(ConnError::InvalidState("multiplexed acceptor was already started or closed"));
      }
      inner.state.advance(AcceptorState::Running);
    }
    let Some(poll) = self.poll.lock().take() else {
      return Err(ConnError::Internal("selector already handed to a loop".into()));
    };

    let shared = self.shared.clone();
    let launched = match pool {
      Some(pool) => pool.execute(Box::new(move || poll_loop(shared, poll))),
      None => thread::Builder::new()
        .name(format!("{}-poll", self.shared.name))
        .spawn(move || poll_loop(shared, poll))
        .map(|handle| {
          *self.loop_thread.lock() = Some(handle);
        })
        .map_err(ConnError::from),
    };
    if let Err(e) = launched {
      tracing::error!(mux = %self.shared.name, "Failed to launch selection loop: {}", e);
      self.shared.mark_stopped();
      return Err(e);
    }
    tracing::info!(mux = %self.shared.name, "Selection loop started");
    Ok(())
  }

  /// Closes every listener, sharing one graceful deadline, then stops the loop.
  fn close(&self, wait_timeout: Duration, force_shutdown: bool) -> Result<(), ConnError> {
    let started = Instant::now();
    let previous = {
      let mut inner = self.shared.inner.lock();
      let previous = inner.state;
      match previous {
        AcceptorState::Created => inner.state.advance(AcceptorState::Stopped),
        AcceptorState::Running => inner.state.advance(AcceptorState::Stopping),
        _ => false,
      };
      self.shared.changed.notify_all();
      previous
    };
    match previous {
      AcceptorState::Stopped => return Ok(()),
      AcceptorState::Stopping => {
        self.shared.wait_stopped(deadline_after(self.shared.poll_timeout + STOP_SLACK));
        return Ok(());
      }
      _ => {}
    }

    let listeners: Vec<Arc<MultiplexedListener>> = self.shared.inner.lock().by_token.values().cloned().collect();
    tracing::info!(mux = %self.shared.name, listeners = listeners.len(), "Closing multiplexed acceptor");
    let mut first_error = None;
    for listener in listeners {
      if let Err(e) = listener.close_from(started, wait_timeout, force_shutdown) {
        tracing::error!(mux = %self.shared.name, name = %listener.name(), "Failed to close listener: {}", e);
        first_error.get_or_insert(e);
      }
    }

    if previous == AcceptorState::Running {
      if let Err(e) = self.shared.waker.wake() {
        tracing::warn!(mux = %self.shared.name, "Failed to wake selection loop: {}", e);
      }
      if !self.shared.wait_stopped(deadline_after(self.shared.poll_timeout + STOP_SLACK)) {
        return Err(ConnError::Timeout);
      }
      self.join_loop_thread()?;
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn state(&self) -> AcceptorState {
    self.shared.state()
  }

  fn live_connections(&self) -> usize {
    let listeners: Vec<Arc<MultiplexedListener>> = self.shared.inner.lock().by_token.values().cloned().collect();
    listeners.iter().map(|l| l.live_connections()).sum()
  }

  /// A shared loop has no single address; see each listener.
  fn local_addr(&self) -> Option<SocketAddr> {
    None
  }
}

impl Drop for MultiplexedAcceptor {
  fn drop(&mut self) {
    if self.shared.state() < AcceptorState::Stopped {
      if let Err(e) = self.close(Duration::ZERO, true) {
        tracing::warn!(mux = %self.shared.name, "Error closing multiplexed acceptor on drop: {}", e);
      }
    }
  }
}

impl fmt::Debug for MultiplexedAcceptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.shared.inner.lock();
    f.debug_struct("MultiplexedAcceptor")
      .field("name", &self.shared.name)
      .field("state", &inner.state)
      .field("listeners", &inner.by_name.keys().collect::<Vec<_>>())
      .finish()
  }
}

/// One listening socket attached to a `MultiplexedAcceptor`.
pub struct MultiplexedListener {
  core: Arc<ListenerCore>,
  listen: Box<dyn ListenSocket>,
  token: Token,
  mux: Weak<MuxShared>,
  force_grace: Duration,
}

impl MultiplexedListener {
  /// Accepts until the socket would block. The selector is edge-triggered, so
  /// returning early would strand connections already queued on the socket.
  fn accept_ready(&self) {
    let mut failures = 0usize;
    loop {
      if !self.core.is_accepting() {
        return;
      }
      match self.listen.accept() {
        Ok((stream, peer_addr)) => {
          failures = 0;
          self.core.dispatch(stream, peer_addr);
        }
        Err(e) if is_accept_timeout(&e) => return,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => {
          if !self.core.is_accepting() {
            return;
          }
          tracing::error!(name = %self.core.name(), "Error accepting connection: {}", e);
          self.core.notify(ConnectionEvent::AcceptFailed {
            name: self.core.name().to_string(),
            error_msg: e.to_string(),
          });
          failures += 1;
          if failures >= MAX_ACCEPT_RETRIES {
            // Persistent failure (EMFILE and friends): back off, then ask the
            // selector to report the socket again instead of spinning here.
            thread::sleep(ACCEPT_ERROR_BACKOFF);
            self.rearm();
            return;
          }
        }
      }
    }
  }

  /// Re-registers the listen socket so pending readiness is delivered again.
  fn rearm(&self) {
    let (Some(mux), Some(fd)) = (self.mux.upgrade(), self.listen.raw_fd()) else {
      return;
    };
    if let Err(e) = mux.registry.reregister(&mut SourceFd(&fd), self.token, Interest::READABLE) {
      tracing::warn!(name = %self.core.name(), "Failed to re-arm listen socket: {}", e);
    }
  }

  /// Leaves the selector and the registry, then closes the socket.
  fn detach_and_close(&self) {
    if let Some(mux) = self.mux.upgrade() {
      if let Some(fd) = self.listen.raw_fd() {
        if let Err(e) = mux.registry.deregister(&mut SourceFd(&fd)) {
          // Never registered (not started) or already gone.
          tracing::trace!(name = %self.core.name(), "Deregistering listen socket: {}", e);
        }
      }
      mux.detach(self.core.name(), self.token);
    }
    close_listen_socket(&self.core, self.listen.as_ref());
  }

  fn close_from(&self, started: Instant, wait_timeout: Duration, force_shutdown: bool) -> Result<(), ConnError> {
    match self.core.begin_stop() {
      StopRequest::AlreadyStopped => return Ok(()),
      StopRequest::AlreadyStopping => {
        self.core.wait_stopped(deadline_after(STOP_SLACK));
        return Ok(());
      }
      StopRequest::NeverStarted => {
        self.detach_and_close();
        self.core.mark_stopped();
        return Ok(());
      }
      StopRequest::Stopping => {}
    }
    tracing::info!(name = %self.core.name(), ?wait_timeout, force_shutdown, "Closing listener");
    self.detach_and_close();
    self.core.notify(ConnectionEvent::Closed {
      name: self.core.name().to_string(),
    });
    self.core.mark_stopped();
    drain_runners(&self.core, started, wait_timeout, force_shutdown, self.force_grace);
    Ok(())
  }
}

impl Acceptor for MultiplexedListener {
  fn name(&self) -> &str {
    self.core.name()
  }

  fn start(&self, pool: Option<Arc<dyn ThreadPool>>) -> Result<(), ConnError> {
    let mux = self
      .mux
      .upgrade()
      .ok_or(ConnError::InvalidState("multiplexed acceptor was dropped"))?;
    if mux.state() > AcceptorState::Running {
      return Err(ConnError::InvalidState("multiplexed acceptor is shutting down"));
    }
    let fd = self
      .listen
      .raw_fd()
      .ok_or(ConnError::InvalidState("listen socket is closed"))?;
    self.listen.set_nonblocking(true)?;
    self.core.start(pool)?;

    if let Err(e) = mux.registry.register(&mut SourceFd(&fd), self.token, Interest::READABLE) {
      tracing::error!(name = %self.core.name(), "Failed to register listen socket: {}", e);
      self.core.begin_stop();
      self.detach_and_close();
      self.core.mark_stopped();
      return Err(e.into());
    }

    let local_addr = self.listen.local_addr().map(|a| a.to_string()).unwrap_or_default();
    tracing::info!(mux = %mux.name, name = %self.core.name(), %local_addr, "Listener registered with selector");
    self.core.notify(ConnectionEvent::Listening {
      name: self.core.name().to_string(),
      local_addr,
    });
    Ok(())
  }

  fn close(&self, wait_timeout: Duration, force_shutdown: bool) -> Result<(), ConnError> {
    self.close_from(Instant::now(), wait_timeout, force_shutdown)
  }

  fn state(&self) -> AcceptorState {
    self.core.state()
  }

  fn live_connections(&self) -> usize {
    self.core.live_count()
  }

  fn local_addr(&self) -> Option<SocketAddr> {
    self.listen.local_addr().ok()
  }
}

impl fmt::Debug for MultiplexedListener {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MultiplexedListener")
      .field("core", &self.core)
      .field("listen", &self.listen)
      .field("token", &self.token.0)
      .finish()
  }
}

struct PollLoopGuard {
  shared: Arc<MuxShared>,
}

impl Drop for PollLoopGuard {
  fn drop(&mut self) {
    if thread::panicking() {
      tracing::error!(mux = %self.shared.name, "Selection loop panicked");
    }
    self.shared.mark_stopped();
    tracing::debug!(mux = %self.shared.name, "Selection loop finished");
  }
}

fn poll_loop(shared: Arc<MuxShared>, mut poll: Poll) {
  let _guard = PollLoopGuard { shared: shared.clone() };
  let mut events = Events::with_capacity(shared.poll_capacity);

  while shared.state() == AcceptorState::Running {
    if let Err(e) = poll.poll(&mut events, Some(shared.poll_timeout)) {
      if e.kind() == io::ErrorKind::Interrupted {
        continue;
      }
      tracing::error!(mux = %shared.name, "Selector poll failed: {}", e);
      shared.monitor.on_event(&ConnectionEvent::AcceptFailed {
        name: shared.name.to_string(),
        error_msg: e.to_string(),
      });
      thread::sleep(POLL_ERROR_BACKOFF);
      continue;
    }

    for event in events.iter() {
      let token = event.token();
      if token == WAKER_TOKEN {
        continue;
      }
      match shared.listener_for(token) {
        Some(listener) => listener.accept_ready(),
        None => tracing::trace!(mux = %shared.name, token = token.0, "Readiness for a detached listener"),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handler::{Connection, ConnectionHandler, FactoryHandlerSource};
  use crate::monitor::NullMonitor;
  use crate::transport::bind_tcp;

  fn config(name: &str) -> AcceptorConfig {
    let listen = bind_tcp("127.0.0.1:0", 16).unwrap();
    let source = Arc::new(FactoryHandlerSource::new(|| {
      Box::new(|_conn: &mut Connection| -> Result<(), ConnError> { Ok(()) }) as Box<dyn ConnectionHandler>
    }));
    AcceptorConfig::new(name, Box::new(listen), source).unwrap()
  }

  #[test]
  fn duplicate_listener_names_are_rejected() {
    let mux = MultiplexedAcceptor::new("mux", Arc::new(NullMonitor)).unwrap();
    let _first = mux.register(config("a")).unwrap();
    assert!(matches!(mux.register(config("a")), Err(ConnError::DuplicateName(n)) if n == "a"));
    assert_eq!(mux.listener_count(), 1);
  }

  #[test]
  fn closing_a_listener_detaches_it() {
    let mux = MultiplexedAcceptor::new("mux", Arc::new(NullMonitor)).unwrap();
    mux.start(None).unwrap();
    let listener = mux.register(config("a")).unwrap();
    listener.start(None).unwrap();
    assert!(listener.is_running());

    listener.close(Duration::ZERO, false).unwrap();
    assert_eq!(listener.state(), AcceptorState::Stopped);
    assert!(mux.listener("a").is_none());
    // The name is free again.
    let again = mux.register(config("a")).unwrap();
    again.start(None).unwrap();

    mux.close(Duration::ZERO, true).unwrap();
    assert_eq!(mux.state(), AcceptorState::Stopped);
    assert_eq!(again.state(), AcceptorState::Stopped);
  }

  #[test]
  fn register_after_close_is_rejected() {
    let mux = MultiplexedAcceptor::new("mux", Arc::new(NullMonitor)).unwrap();
    mux.close(Duration::ZERO, false).unwrap();
    assert!(matches!(mux.register(config("late")), Err(ConnError::InvalidState(_))));
  }
}
