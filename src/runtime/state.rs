// src/runtime/state.rs

use std::fmt;

/// Lifecycle of an acceptor (or of the shared multiplexed loop).
///
/// Variants are ordered; transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AcceptorState {
  /// Constructed, accept loop not launched yet.
  Created,
  /// Accept loop launched and accepting.
  Running,
  /// Close requested; new connections are refused.
  Stopping,
  /// Accept loop exited and the listen socket is closed.
  Stopped,
}

impl AcceptorState {
  /// Moves to `next` if that is a forward transition. Returns whether the state changed.
  pub(crate) fn advance(&mut self, next: AcceptorState) -> bool {
    if next > *self {
      tracing::trace!(from = ?*self, to = ?next, "Acceptor state transition");
      *self = next;
      true
    } else {
      false
    }
  }

  pub fn is_running(self) -> bool {
    self == AcceptorState::Running
  }
}

impl fmt::Display for AcceptorState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      AcceptorState::Created => "CREATED",
      AcceptorState::Running => "RUNNING",
      AcceptorState::Stopping => "STOPPING",
      AcceptorState::Stopped => "STOPPED",
    };
    f.write_str(s)
  }
}
