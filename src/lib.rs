//! raccept - named TCP acceptors with per-connection runners, monitored
//! failures and graceful-then-forced shutdown.

pub mod acceptor;
pub mod error;
pub mod handler;
pub mod manager;
pub mod monitor;
pub mod options;
pub mod runtime;
pub mod transport;

// Re-export core types for user convenience
pub use acceptor::{Acceptor, AcceptorConfig, ConnectionAcceptor};
#[cfg(feature = "multiplexed")]
pub use acceptor::{MultiplexedAcceptor, MultiplexedListener};
pub use error::ConnError;
pub use handler::{Connection, ConnectionHandler, FactoryHandlerSource, HandlerSource, PooledHandlerSource};
pub use manager::ConnectionManager;
pub use monitor::{channel_monitor, ChannelMonitor, ConnectionEvent, Monitor, NullMonitor, TracingMonitor};
pub use options::{AcceptorKind, ManagerOptions};
pub use runtime::{AcceptorState, DedicatedThreads, ThreadPool, WorkerPool};
pub use transport::{bind_tcp, ListenSocket, TcpListenSocket};

/// Creates a manager with default options and no monitor.
pub fn manager() -> ConnectionManager {
  ConnectionManager::new()
}
