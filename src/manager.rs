// src/manager.rs

//! The named registry of running acceptors.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::acceptor::{Acceptor, AcceptorConfig, ConnectionAcceptor};
#[cfg(feature = "multiplexed")]
use crate::acceptor::MultiplexedAcceptor;
use crate::error::ConnError;
use crate::handler::HandlerSource;
use crate::monitor::{ConnectionEvent, Monitor, NullMonitor};
use crate::options::{AcceptorKind, ManagerOptions, DEFAULT_BACKLOG};
use crate::runtime::ThreadPool;
use crate::transport::{bind_tcp, ListenSocket};

/// Name of the shared selection loop the manager creates for multiplexed listeners.
#[cfg(feature = "multiplexed")]
const MULTIPLEXED_LOOP_NAME: &str = "multiplexed";

/// Maps connection names to running acceptors.
///
/// Each manager owns its registry; there is no process-wide instance. The
/// registry mutex is independent of every acceptor's own lock and is never
/// held while an acceptor is being closed.
pub struct ConnectionManager {
  options: ManagerOptions,
  monitor: Arc<dyn Monitor>,
  default_pool: Option<Arc<dyn ThreadPool>>,
  acceptors: Mutex<HashMap<String, Arc<dyn Acceptor>>>,
  #[cfg(feature = "multiplexed")]
  mux: Mutex<Option<Arc<MultiplexedAcceptor>>>,
}

impl ConnectionManager {
  pub fn new() -> Self {
    Self {
      options: ManagerOptions::default(),
      monitor: Arc::new(NullMonitor),
      default_pool: None,
      acceptors: Mutex::new(HashMap::new()),
      #[cfg(feature = "multiplexed")]
      mux: Mutex::new(None),
    }
  }

  pub fn with_options(mut self, options: ManagerOptions) -> Self {
    self.options = options;
    self
  }

  pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
    self.monitor = monitor;
    self
  }

  /// Pool used by `connect` for accept loops and runners when the caller gives none.
  pub fn with_thread_pool(mut self, pool: Arc<dyn ThreadPool>) -> Self {
    self.default_pool = Some(pool);
    self
  }

  pub fn options(&self) -> &ManagerOptions {
    &self.options
  }

  /// Registers and starts an acceptor for `listen` under `name`.
  pub fn connect<L>(&self, name: &str, listen: L, source: Arc<dyn HandlerSource>) -> Result<(), ConnError>
  where
    L: ListenSocket + 'static,
  {
    self.connect_with_pool(name, listen, source, None)
  }

  /// Like `connect`, running on `pool` instead of the manager's default.
  pub fn connect_with_pool<L>(
    &self,
    name: &str,
    listen: L,
    source: Arc<dyn HandlerSource>,
    pool: Option<Arc<dyn ThreadPool>>,
  ) -> Result<(), ConnError>
  where
    L: ListenSocket + 'static,
  {
    let config = AcceptorConfig::new(name, Box::new(listen), source)?;
    let pool = pool.or_else(|| self.default_pool.clone());

    let mut acceptors = self.acceptors.lock();
    if acceptors.contains_key(name) {
      tracing::debug!(name = %name, "Connection name already registered");
      return Err(ConnError::DuplicateName(name.to_string()));
    }

    self.apply_default_accept_timeout(&config)?;
    let acceptor = self.build_acceptor(config)?;
    if let Err(e) = acceptor.start(pool) {
      tracing::error!(name = %name, "Failed to start acceptor: {}", e);
      // Releases the socket and any registration the acceptor made.
      if let Err(close_err) = acceptor.close(Duration::ZERO, false) {
        tracing::warn!(name = %name, "Error cleaning up acceptor that failed to start: {}", close_err);
      }
      return Err(e);
    }
    acceptors.insert(name.to_string(), acceptor);
    tracing::info!(name = %name, kind = ?self.options.acceptor_kind, "Connection registered");
    Ok(())
  }

  /// Binds `endpoint` (`tcp://host:port` or `host:port`) and connects it.
  /// Returns the bound address, which resolves a requested port of 0.
  pub fn connect_tcp(
    &self,
    name: &str,
    endpoint: &str,
    source: Arc<dyn HandlerSource>,
  ) -> Result<SocketAddr, ConnError> {
    let listen = bind_tcp(endpoint, DEFAULT_BACKLOG)?;
    let local_addr = listen.local_addr()?;
    self.connect(name, listen, source)?;
    Ok(local_addr)
  }

  /// Removes `name` from the registry, then closes its acceptor.
  ///
  /// `forceful = false` waits up to the configured shutdown timeout for live
  /// connections; `forceful = true` does not wait. Either way, connections
  /// still live afterwards are force-closed when `force_shutdown` is set.
  ///
  /// Only `UnknownName` is returned. Once the entry is removed, a shutdown that
  /// does not complete is logged and reported as `ConnectionEvent::ShutdownFailed`.
  pub fn disconnect(&self, name: &str, forceful: bool) -> Result<(), ConnError> {
    let acceptor = self
      .acceptors
      .lock()
      .remove(name)
      .ok_or_else(|| ConnError::UnknownName(name.to_string()))?;

    let wait = if forceful {
      Duration::ZERO
    } else {
      self.options.shutdown_timeout
    };
    tracing::info!(name = %name, forceful, "Disconnecting");
    if let Err(e) = acceptor.close(wait, self.options.force_shutdown) {
      tracing::error!(name = %name, "Acceptor did not shut down cleanly: {}", e);
      self.monitor.on_event(&ConnectionEvent::ShutdownFailed {
        name: name.to_string(),
        error_msg: e.to_string(),
      });
    }
    Ok(())
  }

  /// Forcefully disconnects every registered acceptor.
  ///
  /// Errors are logged per acceptor and never stop the remaining teardown.
  pub fn dispose_all(&self) {
    let names: Vec<String> = self.acceptors.lock().keys().cloned().collect();
    if !names.is_empty() {
      tracing::info!(count = names.len(), "Disposing all connections");
    }
    let mut failures = 0usize;
    for name in names {
      match self.disconnect(&name, true) {
        Ok(()) => {}
        // Raced with a concurrent disconnect.
        Err(ConnError::UnknownName(_)) => {}
        Err(e) => {
          failures += 1;
          tracing::error!(name = %name, "Error disposing connection: {}", e);
        }
      }
    }

    #[cfg(feature = "multiplexed")]
    {
      let mux = self.mux.lock().take();
      if let Some(mux) = mux {
        if let Err(e) = mux.close(Duration::ZERO, self.options.force_shutdown) {
          failures += 1;
          tracing::error!(mux = %mux.name(), "Error closing selection loop: {}", e);
          self.monitor.on_event(&ConnectionEvent::ShutdownFailed {
            name: mux.name().to_string(),
            error_msg: e.to_string(),
          });
        }
      }
    }

    if failures > 0 {
      tracing::warn!(failures, "Disposal finished with errors");
    }
  }

  pub fn is_connected(&self, name: &str) -> bool {
    self.acceptors.lock().contains_key(name)
  }

  /// Registered names, sorted.
  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.acceptors.lock().keys().cloned().collect();
    names.sort();
    names
  }

  pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
    let acceptor = self.acceptors.lock().get(name).cloned()?;
    acceptor.local_addr()
  }

  pub fn live_connections(&self, name: &str) -> Option<usize> {
    let acceptor = self.acceptors.lock().get(name).cloned()?;
    Some(acceptor.live_connections())
  }

  fn apply_default_accept_timeout(&self, config: &AcceptorConfig) -> Result<(), ConnError> {
    let listen = config.listen_socket();
    if listen.accept_timeout()?.is_none() {
      tracing::debug!(name = %config.name(), timeout = ?self.options.accept_timeout, "Applying default accept timeout");
      listen.set_accept_timeout(Some(self.options.accept_timeout))?;
    }
    Ok(())
  }

  fn build_acceptor(&self, config: AcceptorConfig) -> Result<Arc<dyn Acceptor>, ConnError> {
    match self.options.acceptor_kind {
      AcceptorKind::Blocking => Ok(Arc::new(
        ConnectionAcceptor::new(config, self.monitor.clone()).with_force_grace(self.options.force_grace),
      )),
      #[cfg(feature = "multiplexed")]
      AcceptorKind::Multiplexed => {
        let listener = self.multiplexed()?.register(config)?;
        Ok(listener)
      }
      #[cfg(not(feature = "multiplexed"))]
      AcceptorKind::Multiplexed => Err(ConnError::UnsupportedFeature(
        "multiplexed acceptor requires the 'multiplexed' feature",
      )),
    }
  }

  /// The shared selection loop, started on first use.
  #[cfg(feature = "multiplexed")]
  fn multiplexed(&self) -> Result<Arc<MultiplexedAcceptor>, ConnError> {
    let mut slot = self.mux.lock();
    if let Some(mux) = slot.as_ref() {
      if mux.is_running() {
        return Ok(mux.clone());
      }
    }
    let mux = Arc::new(MultiplexedAcceptor::with_settings(
      MULTIPLEXED_LOOP_NAME,
      self.monitor.clone(),
      self.options.poll_capacity,
      self.options.force_grace,
    )?);
    mux.start(self.default_pool.clone())?;
    *slot = Some(mux.clone());
    Ok(mux)
  }
}

impl Default for ConnectionManager {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for ConnectionManager {
  fn drop(&mut self) {
    self.dispose_all();
  }
}

impl fmt::Debug for ConnectionManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionManager")
      .field("options", &self.options)
      .field("names", &self.names())
      .finish_non_exhaustive()
  }
}
