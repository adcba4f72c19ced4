// src/runtime/mod.rs

//! Threading primitives: executors and the acceptor lifecycle state.

pub mod pool;
pub mod state;

pub use pool::{DedicatedThreads, Task, ThreadPool, WorkerPool};
pub use state::AcceptorState;

use std::time::{Duration, Instant};

/// `now + timeout`, saturating far into the future instead of overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
  let now = Instant::now();
  now
    .checked_add(timeout)
    .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}
