use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
#[non_exhaustive] // Allows adding more variants later without breaking change
pub enum ConnError {
  // --- I/O Errors ---
  /// Kept as kind + message so the error stays `Clone` and can travel in events.
  #[error("I/O error ({kind:?}): {message}")]
  IoError { kind: io::ErrorKind, message: String },

  // --- API Misuse ---
  #[error("Invalid argument provided: {0}")]
  InvalidArgument(String),
  #[error("Connection name already registered: {0}")]
  DuplicateName(String),
  #[error("No connection registered under name: {0}")]
  UnknownName(String),

  // --- Handler Errors ---
  #[error("Failed to acquire connection handler: {0}")]
  AcquisitionFailed(String),
  #[error("Handler pool exhausted ({0} handlers in use)")]
  PoolExhausted(usize),
  #[error("Connection handler failed: {0}")]
  HandlerFailed(String),

  // --- Execution Errors ---
  #[error("Task rejected by thread pool: {0}")]
  DispatchRejected(String),

  // --- State Errors ---
  #[error("Operation is invalid for the current acceptor state: {0}")]
  InvalidState(&'static str),
  #[error("Shutdown of '{name}' incomplete: {remaining} connection(s) still live")]
  ShutdownIncomplete { name: String, remaining: usize },
  #[error("Operation timed out")]
  Timeout,

  // --- Option Errors ---
  #[error("Invalid option ID: {0}")]
  InvalidOption(i32),
  #[error("Invalid value provided for option ID {0}")]
  InvalidOptionValue(i32),

  // --- Unsupported ---
  #[error("Feature not supported or enabled: {0}")]
  UnsupportedFeature(&'static str),

  // --- Internal Errors ---
  #[error("Internal library error: {0}")]
  Internal(String),
}

impl From<io::Error> for ConnError {
  fn from(e: io::Error) -> Self {
    ConnError::IoError {
      kind: e.kind(),
      message: e.to_string(),
    }
  }
}

impl ConnError {
  /// Maps a bind/listen failure onto an error naming the offending address.
  pub fn from_io_endpoint(e: io::Error, endpoint: &str) -> Self {
    match e.kind() {
      io::ErrorKind::AddrInUse => ConnError::IoError {
        kind: e.kind(),
        message: format!("address already in use: {}", endpoint),
      },
      io::ErrorKind::AddrNotAvailable => ConnError::IoError {
        kind: e.kind(),
        message: format!("address not available: {}", endpoint),
      },
      io::ErrorKind::PermissionDenied => ConnError::IoError {
        kind: e.kind(),
        message: format!("permission denied for endpoint: {}", endpoint),
      },
      io::ErrorKind::InvalidInput => ConnError::InvalidArgument(format!("invalid endpoint '{}': {}", endpoint, e)),
      _ => ConnError::from(e),
    }
  }

  /// True for errors raised while obtaining a handler from a `HandlerSource`.
  pub fn is_acquisition_error(&self) -> bool {
    matches!(self, ConnError::AcquisitionFailed(_) | ConnError::PoolExhausted(_))
  }

  /// True for errors caused by misuse of the public API.
  pub fn is_usage_error(&self) -> bool {
    matches!(
      self,
      ConnError::InvalidArgument(_) | ConnError::DuplicateName(_) | ConnError::UnknownName(_)
    )
  }
}
