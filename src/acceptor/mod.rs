// src/acceptor/mod.rs

//! Acceptors: accept loops, per-connection runners and their shutdown.

pub(crate) mod lifecycle;
pub(crate) mod runner;

pub mod blocking;
#[cfg(feature = "multiplexed")]
pub mod multiplexed;

pub use blocking::ConnectionAcceptor;
#[cfg(feature = "multiplexed")]
pub use multiplexed::{MultiplexedAcceptor, MultiplexedListener};

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConnError;
use crate::handler::HandlerSource;
use crate::runtime::{AcceptorState, ThreadPool};
use crate::transport::ListenSocket;

/// Everything an acceptor needs: its name, its listen socket and its handler source.
pub struct AcceptorConfig {
  name: String,
  listen: Box<dyn ListenSocket>,
  source: Arc<dyn HandlerSource>,
}

impl AcceptorConfig {
  /// Validates the inputs. The name must be non-blank and the socket must still be open.
  pub fn new(
    name: impl Into<String>,
    listen: Box<dyn ListenSocket>,
    source: Arc<dyn HandlerSource>,
  ) -> Result<Self, ConnError> {
    let name = name.into();
    if name.trim().is_empty() {
      return Err(ConnError::InvalidArgument("connection name must not be empty".into()));
    }
    if let Err(e) = listen.local_addr() {
      return Err(ConnError::InvalidArgument(format!(
        "listen socket for '{}' is not usable: {}",
        name, e
      )));
    }
    Ok(Self { name, listen, source })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn listen_socket(&self) -> &dyn ListenSocket {
    self.listen.as_ref()
  }

  pub fn handler_source(&self) -> &Arc<dyn HandlerSource> {
    &self.source
  }

  pub(crate) fn into_parts(self) -> (String, Box<dyn ListenSocket>, Arc<dyn HandlerSource>) {
    (self.name, self.listen, self.source)
  }
}

impl fmt::Debug for AcceptorConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AcceptorConfig")
      .field("name", &self.name)
      .field("listen", &self.listen)
      .finish_non_exhaustive()
  }
}

/// The lifecycle contract shared by every acceptor realization.
pub trait Acceptor: Send + Sync + fmt::Debug {
  fn name(&self) -> &str;

  /// Launches accepting. Runners (and, for the blocking acceptor, the accept
  /// loop) execute on `pool`, or on dedicated threads when `None`.
  fn start(&self, pool: Option<Arc<dyn ThreadPool>>) -> Result<(), ConnError>;

  /// Stops accepting, then waits up to `wait_timeout` for live connections to
  /// finish. With `force_shutdown`, connections still live afterwards are
  /// closed under their handlers. Idempotent.
  fn close(&self, wait_timeout: Duration, force_shutdown: bool) -> Result<(), ConnError>;

  fn state(&self) -> AcceptorState;

  fn is_running(&self) -> bool {
    self.state().is_running()
  }

  /// Number of connections currently tracked as live.
  fn live_connections(&self) -> usize;

  /// Bound address of the listen socket while it is open.
  fn local_addr(&self) -> Option<SocketAddr>;
}
