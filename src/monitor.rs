// src/monitor.rs

//! Lifecycle and error notifications emitted by acceptors and runners.

use std::fmt;
use std::sync::Arc;

/// Represents significant events occurring within an acceptor or its connections.
/// Every event carries the name the acceptor was registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive] // Allow adding more events later
pub enum ConnectionEvent {
  // --- Listener Events ---
  /// The acceptor started accepting on `local_addr`.
  Listening { name: String, local_addr: String },
  /// Accepted a new connection from `peer_addr`.
  Accepted { name: String, peer_addr: String },
  /// The listen socket reported an error other than a timeout or interruption.
  AcceptFailed { name: String, error_msg: String },
  /// No handler could be obtained; the accepted connection was dropped.
  AcquireFailed {
    name: String,
    peer_addr: String,
    error_msg: String,
  },
  /// The thread pool refused a runner or an accept loop.
  DispatchFailed { name: String, error_msg: String },

  // --- Connection Events ---
  /// The handler returned an error or panicked.
  HandlerFailed {
    name: String,
    peer_addr: String,
    error_msg: String,
  },
  /// Closing the listen socket or a connection socket failed.
  CloseFailed { name: String, error_msg: String },
  /// A runner finished after it had already been removed from the live set.
  DoubleDispose { name: String, runner_id: u64 },
  /// A connection was torn down and its handler released.
  Disconnected { name: String, peer_addr: String },

  // --- Shutdown Events ---
  /// Live connections were closed forcibly after the graceful wait ran out.
  ForcedShutdown { name: String, runners: usize },
  /// The accept loop exited and the listen socket is closed.
  Closed { name: String },
  /// `disconnect` removed the name but its acceptor did not shut down cleanly.
  ShutdownFailed { name: String, error_msg: String },
}

impl ConnectionEvent {
  /// Name of the acceptor that emitted the event.
  pub fn name(&self) -> &str {
    match self {
      ConnectionEvent::Listening { name, .. }
      | ConnectionEvent::Accepted { name, .. }
      | ConnectionEvent::AcceptFailed { name, .. }
      | ConnectionEvent::AcquireFailed { name, .. }
      | ConnectionEvent::DispatchFailed { name, .. }
      | ConnectionEvent::HandlerFailed { name, .. }
      | ConnectionEvent::CloseFailed { name, .. }
      | ConnectionEvent::DoubleDispose { name, .. }
      | ConnectionEvent::Disconnected { name, .. }
      | ConnectionEvent::ForcedShutdown { name, .. }
      | ConnectionEvent::Closed { name }
      | ConnectionEvent::ShutdownFailed { name, .. } => name,
    }
  }

  /// True for the error-class notifications.
  pub fn is_error(&self) -> bool {
    matches!(
      self,
      ConnectionEvent::AcceptFailed { .. }
        | ConnectionEvent::AcquireFailed { .. }
        | ConnectionEvent::DispatchFailed { .. }
        | ConnectionEvent::HandlerFailed { .. }
        | ConnectionEvent::CloseFailed { .. }
        | ConnectionEvent::ShutdownFailed { .. }
    )
  }
}

/// Receives notifications from acceptors. Called on accept and runner threads,
/// so implementations must not block for long.
pub trait Monitor: Send + Sync {
  fn on_event(&self, event: &ConnectionEvent);
}

impl<F> Monitor for F
where
  F: Fn(&ConnectionEvent) + Send + Sync,
{
  fn on_event(&self, event: &ConnectionEvent) {
    self(event)
  }
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMonitor;

impl Monitor for NullMonitor {
  fn on_event(&self, _event: &ConnectionEvent) {}
}

/// Logs every notification through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
  fn on_event(&self, event: &ConnectionEvent) {
    match event {
      ConnectionEvent::Listening { name, local_addr } => {
        tracing::info!(name = %name, %local_addr, "Acceptor listening")
      }
      ConnectionEvent::Accepted { name, peer_addr } => {
        tracing::debug!(name = %name, peer = %peer_addr, "Connection accepted")
      }
      ConnectionEvent::AcceptFailed { name, error_msg } => {
        tracing::error!(name = %name, error = %error_msg, "Accept failed")
      }
      ConnectionEvent::AcquireFailed {
        name,
        peer_addr,
        error_msg,
      } => tracing::error!(name = %name, peer = %peer_addr, error = %error_msg, "Handler acquisition failed"),
      ConnectionEvent::DispatchFailed { name, error_msg } => {
        tracing::error!(name = %name, error = %error_msg, "Dispatch failed")
      }
      ConnectionEvent::HandlerFailed {
        name,
        peer_addr,
        error_msg,
      } => tracing::warn!(name = %name, peer = %peer_addr, error = %error_msg, "Connection handler failed"),
      ConnectionEvent::CloseFailed { name, error_msg } => {
        tracing::error!(name = %name, error = %error_msg, "Socket close failed")
      }
      ConnectionEvent::DoubleDispose { name, runner_id } => {
        tracing::debug!(name = %name, runner = runner_id, "Runner disposed after removal")
      }
      ConnectionEvent::Disconnected { name, peer_addr } => {
        tracing::debug!(name = %name, peer = %peer_addr, "Connection closed")
      }
      ConnectionEvent::ForcedShutdown { name, runners } => {
        tracing::warn!(name = %name, runners, "Forced shutdown of live connections")
      }
      ConnectionEvent::Closed { name } => tracing::info!(name = %name, "Acceptor closed"),
      ConnectionEvent::ShutdownFailed { name, error_msg } => {
        tracing::error!(name = %name, error = %error_msg, "Acceptor shutdown incomplete")
      }
    }
  }
}

// Type alias for the channel sender used for monitor events
pub type MonitorSender = async_channel::Sender<ConnectionEvent>;
// Type alias for the channel receiver used for monitor events
pub type MonitorReceiver = async_channel::Receiver<ConnectionEvent>;

// Default capacity for monitor channel
pub const DEFAULT_MONITOR_CAPACITY: usize = 100;

/// Forwards notifications into a bounded channel.
///
/// Events are dropped (with a trace log) when the channel is full or closed;
/// a slow consumer never stalls an accept loop.
#[derive(Clone)]
pub struct ChannelMonitor {
  tx: MonitorSender,
}

impl ChannelMonitor {
  pub fn new(tx: MonitorSender) -> Self {
    Self { tx }
  }
}

impl fmt::Debug for ChannelMonitor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChannelMonitor")
      .field("queued", &self.tx.len())
      .field("closed", &self.tx.is_closed())
      .finish()
  }
}

impl Monitor for ChannelMonitor {
  fn on_event(&self, event: &ConnectionEvent) {
    if let Err(e) = self.tx.try_send(event.clone()) {
      tracing::trace!(name = %event.name(), "Monitor event dropped: {}", e);
    }
  }
}

/// Creates a `ChannelMonitor` together with the receiving end of its queue.
/// A `capacity` of 0 selects `DEFAULT_MONITOR_CAPACITY`.
pub fn channel_monitor(capacity: usize) -> (Arc<ChannelMonitor>, MonitorReceiver) {
  let capacity = if capacity == 0 { DEFAULT_MONITOR_CAPACITY } else { capacity };
  let (tx, rx) = async_channel::bounded(capacity);
  (Arc::new(ChannelMonitor::new(tx)), rx)
}
