// src/options.rs

use std::time::Duration;

use crate::ConnError;

// Option ids accepted by `ManagerOptions::set_option_raw`.
pub const SHUTDOWN_TIMEOUT: i32 = 1;
pub const FORCE_SHUTDOWN: i32 = 2;
pub const ACCEPT_TIMEOUT: i32 = 3;
pub const FORCE_GRACE: i32 = 4;
pub const ACCEPTOR_KIND: i32 = 5;
pub const POLL_CAPACITY: i32 = 6;

/// Graceful wait used by `ConnectionManager::disconnect(name, false)`.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(2000);
/// Accept timeout applied to listen sockets that carry none.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_millis(250);
/// Bounded wait for runners to exit after their sockets were force-closed.
pub const DEFAULT_FORCE_GRACE: Duration = Duration::from_millis(50);
/// Readiness events fetched per poll by the multiplexed acceptor.
pub const DEFAULT_POLL_CAPACITY: usize = 128;
/// Backlog used by `bind_tcp` when callers have no preference.
pub const DEFAULT_BACKLOG: i32 = 128;

/// Which acceptor realization the manager builds for new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptorKind {
  /// One blocking accept thread per listening socket.
  #[default]
  Blocking,
  /// One shared readiness-selection loop for every listening socket.
  Multiplexed,
}

impl AcceptorKind {
  fn from_raw(value: i32) -> Result<Self, ConnError> {
    match value {
      0 => Ok(AcceptorKind::Blocking),
      1 => Ok(AcceptorKind::Multiplexed),
      _ => Err(ConnError::InvalidOptionValue(ACCEPTOR_KIND)),
    }
  }
}

/// Holds parsed and validated manager options.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
  pub shutdown_timeout: Duration,
  /// Escalate to forced teardown once the graceful wait has elapsed.
  pub force_shutdown: bool,
  pub accept_timeout: Duration,
  pub force_grace: Duration,
  pub acceptor_kind: AcceptorKind,
  pub poll_capacity: usize,
}

impl Default for ManagerOptions {
  fn default() -> Self {
    Self {
      shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
      force_shutdown: true,
      accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
      force_grace: DEFAULT_FORCE_GRACE,
      acceptor_kind: AcceptorKind::Blocking,
      poll_capacity: DEFAULT_POLL_CAPACITY,
    }
  }
}

impl ManagerOptions {
  pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.shutdown_timeout = timeout;
    self
  }

  pub fn with_force_shutdown(mut self, force: bool) -> Self {
    self.force_shutdown = force;
    self
  }

  pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
    self.accept_timeout = timeout;
    self
  }

  pub fn with_force_grace(mut self, grace: Duration) -> Self {
    self.force_grace = grace;
    self
  }

  pub fn with_acceptor_kind(mut self, kind: AcceptorKind) -> Self {
    self.acceptor_kind = kind;
    self
  }

  pub fn with_poll_capacity(mut self, capacity: usize) -> Self {
    self.poll_capacity = capacity.max(1);
    self
  }

  /// Sets an option from its raw native-endian `i32` encoding.
  ///
  /// Durations are milliseconds, booleans are 0/1.
  pub fn set_option_raw(&mut self, option: i32, value: &[u8]) -> Result<(), ConnError> {
    tracing::debug!(option, value_len = value.len(), "Setting manager option");
    match option {
      SHUTDOWN_TIMEOUT => self.shutdown_timeout = parse_duration_ms_option(value, option)?,
      FORCE_SHUTDOWN => self.force_shutdown = parse_bool_option(value, option)?,
      ACCEPT_TIMEOUT => {
        // SO_RCVTIMEO treats zero as "block forever", which would defeat shutdown.
        let timeout = parse_duration_ms_option(value, option)?;
        if timeout.is_zero() {
          return Err(ConnError::InvalidOptionValue(option));
        }
        self.accept_timeout = timeout;
      }
      FORCE_GRACE => self.force_grace = parse_duration_ms_option(value, option)?,
      ACCEPTOR_KIND => self.acceptor_kind = AcceptorKind::from_raw(parse_i32_option(value, option)?)?,
      POLL_CAPACITY => {
        let val = parse_i32_option(value, option)?;
        if val <= 0 {
          return Err(ConnError::InvalidOptionValue(option));
        }
        self.poll_capacity = val as usize;
      }
      _ => return Err(ConnError::InvalidOption(option)),
    }
    Ok(())
  }

  /// Reads an option back in its raw encoding.
  pub fn get_option_raw(&self, option: i32) -> Result<Vec<u8>, ConnError> {
    let val: i32 = match option {
      SHUTDOWN_TIMEOUT => duration_to_ms_i32(self.shutdown_timeout),
      FORCE_SHUTDOWN => self.force_shutdown as i32,
      ACCEPT_TIMEOUT => duration_to_ms_i32(self.accept_timeout),
      FORCE_GRACE => duration_to_ms_i32(self.force_grace),
      ACCEPTOR_KIND => match self.acceptor_kind {
        AcceptorKind::Blocking => 0,
        AcceptorKind::Multiplexed => 1,
      },
      POLL_CAPACITY => i32::try_from(self.poll_capacity).unwrap_or(i32::MAX),
      _ => return Err(ConnError::InvalidOption(option)),
    };
    Ok(val.to_ne_bytes().to_vec())
  }
}

fn duration_to_ms_i32(d: Duration) -> i32 {
  i32::try_from(d.as_millis()).unwrap_or(i32::MAX)
}

// --- Helper functions for parsing option values ---
/// Parses a byte slice representing an integer option.
pub(crate) fn parse_i32_option(value: &[u8], option_id: i32) -> Result<i32, ConnError> {
  let arr: [u8; 4] = value.try_into().map_err(|_| ConnError::InvalidOptionValue(option_id))?;
  Ok(i32::from_ne_bytes(arr))
}

/// Parses a byte slice representing a boolean option (0 or 1).
pub(crate) fn parse_bool_option(value: &[u8], option_id: i32) -> Result<bool, ConnError> {
  match parse_i32_option(value, option_id)? {
    0 => Ok(false),
    1 => Ok(true),
    _ => Err(ConnError::InvalidOptionValue(option_id)),
  }
}

/// Parses a non-negative millisecond count.
pub(crate) fn parse_duration_ms_option(value: &[u8], option_id: i32) -> Result<Duration, ConnError> {
  let val = parse_i32_option(value, option_id)?;
  match val {
    0.. => Ok(Duration::from_millis(val as u64)),
    _ => Err(ConnError::InvalidOptionValue(option_id)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_sane() {
    let opts = ManagerOptions::default();
    assert_eq!(opts.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
    assert!(opts.force_shutdown);
    assert!(!opts.accept_timeout.is_zero());
    assert_eq!(opts.acceptor_kind, AcceptorKind::Blocking);
  }

  #[test]
  fn set_and_get_raw_options() {
    let mut opts = ManagerOptions::default();
    opts.set_option_raw(SHUTDOWN_TIMEOUT, &500i32.to_ne_bytes()).unwrap();
    opts.set_option_raw(FORCE_SHUTDOWN, &0i32.to_ne_bytes()).unwrap();
    opts.set_option_raw(ACCEPTOR_KIND, &1i32.to_ne_bytes()).unwrap();
    opts.set_option_raw(POLL_CAPACITY, &16i32.to_ne_bytes()).unwrap();

    assert_eq!(opts.shutdown_timeout, Duration::from_millis(500));
    assert!(!opts.force_shutdown);
    assert_eq!(opts.acceptor_kind, AcceptorKind::Multiplexed);
    assert_eq!(opts.poll_capacity, 16);
    assert_eq!(opts.get_option_raw(SHUTDOWN_TIMEOUT).unwrap(), 500i32.to_ne_bytes().to_vec());
    assert_eq!(opts.get_option_raw(FORCE_SHUTDOWN).unwrap(), 0i32.to_ne_bytes().to_vec());
  }

  #[test]
  fn rejects_bad_values() {
    let mut opts = ManagerOptions::default();
    assert!(matches!(
      opts.set_option_raw(SHUTDOWN_TIMEOUT, &(-5i32).to_ne_bytes()),
      Err(ConnError::InvalidOptionValue(SHUTDOWN_TIMEOUT))
    ));
    assert!(matches!(
      opts.set_option_raw(ACCEPT_TIMEOUT, &0i32.to_ne_bytes()),
      Err(ConnError::InvalidOptionValue(ACCEPT_TIMEOUT))
    ));
    assert!(matches!(
      opts.set_option_raw(ACCEPTOR_KIND, &7i32.to_ne_bytes()),
      Err(ConnError::InvalidOptionValue(ACCEPTOR_KIND))
    ));
    assert!(matches!(
      opts.set_option_raw(FORCE_SHUTDOWN, &[1u8, 0]),
      Err(ConnError::InvalidOptionValue(FORCE_SHUTDOWN))
    ));
    assert!(matches!(
      opts.set_option_raw(FORCE_SHUTDOWN, &2i32.to_ne_bytes()),
      Err(ConnError::InvalidOptionValue(FORCE_SHUTDOWN))
    ));
    assert!(matches!(
      opts.set_option_raw(POLL_CAPACITY, &[0u8; 3]),
      Err(ConnError::InvalidOptionValue(POLL_CAPACITY))
    ));
    assert!(matches!(
      opts.set_option_raw(999, &1i32.to_ne_bytes()),
      Err(ConnError::InvalidOption(999))
    ));
    // Failed sets leave the previous values in place.
    assert_eq!(opts.accept_timeout, DEFAULT_ACCEPT_TIMEOUT);
  }
}
