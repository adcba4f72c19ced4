// src/runtime/pool.rs

//! Executors for accept loops and connection runners.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::ConnError;

/// A unit of work handed to a `ThreadPool`.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks on some thread other than the caller's.
///
/// Accept loops occupy their worker until the acceptor is closed, so a bounded
/// pool must be sized for every accept loop plus the expected live connections.
pub trait ThreadPool: Send + Sync {
  /// Schedules `task`. On error the task has been dropped without running.
  fn execute(&self, task: Task) -> Result<(), ConnError>;
}

/// Spawns a named OS thread per task. Used when no pool is supplied.
#[derive(Debug, Clone)]
pub struct DedicatedThreads {
  name_prefix: Arc<str>,
  spawned: Arc<AtomicUsize>,
}

impl DedicatedThreads {
  pub fn new(name_prefix: impl Into<String>) -> Self {
    Self {
      name_prefix: Arc::from(name_prefix.into()),
      spawned: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// Number of threads spawned so far.
  pub fn spawned(&self) -> usize {
    self.spawned.load(Ordering::Relaxed)
  }
}

impl ThreadPool for DedicatedThreads {
  fn execute(&self, task: Task) -> Result<(), ConnError> {
    let n = self.spawned.fetch_add(1, Ordering::Relaxed);
    thread::Builder::new()
      .name(format!("{}-{}", self.name_prefix, n))
      .spawn(task)
      .map(|_detached| ())
      .map_err(|e| ConnError::DispatchRejected(format!("failed to spawn thread: {}", e)))
  }
}

/// A fixed set of named worker threads fed through a `crossbeam-channel` queue.
///
/// A panicking task is contained and logged; its worker keeps serving the queue.
pub struct WorkerPool {
  name: String,
  sender: Mutex<Option<Sender<Task>>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
  size: usize,
}

impl WorkerPool {
  pub fn new(name: impl Into<String>, size: usize) -> Result<Self, ConnError> {
    let name = name.into();
    let size = size.max(1);
    let (tx, rx) = unbounded::<Task>();
    let mut workers = Vec::with_capacity(size);
    for i in 0..size {
      let rx = rx.clone();
      let worker_name = format!("{}-worker-{}", name, i);
      let handle = thread::Builder::new().name(worker_name.clone()).spawn(move || {
        tracing::trace!(worker = %worker_name, "Worker started");
        for task in rx.iter() {
          if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!(worker = %worker_name, "Task panicked on worker");
          }
        }
        tracing::trace!(worker = %worker_name, "Worker queue closed, exiting");
      });
      match handle {
        Ok(h) => workers.push(h),
        Err(e) => {
          // Close the queue so already spawned workers exit.
          drop(tx);
          for w in workers {
            let _ = w.join();
          }
          return Err(ConnError::from(e));
        }
      }
    }
    tracing::debug!(pool = %name, size, "Worker pool started");
    Ok(Self {
      name,
      sender: Mutex::new(Some(tx)),
      workers: Mutex::new(workers),
      size,
    })
  }

  pub fn size(&self) -> usize {
    self.size
  }

  /// Stops accepting tasks, lets queued tasks finish and joins every worker.
  pub fn shutdown(&self) {
    let sender = self.sender.lock().take();
    if sender.is_none() {
      return;
    }
    drop(sender);
    let workers = std::mem::take(&mut *self.workers.lock());
    tracing::debug!(pool = %self.name, workers = workers.len(), "Worker pool shutting down");
    let current = thread::current().id();
    for w in workers {
      // A task that shuts down its own pool must not join itself.
      if w.thread().id() == current {
        continue;
      }
      if w.join().is_err() {
        tracing::error!(pool = %self.name, "Worker thread panicked outside a task");
      }
    }
  }
}

impl fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("name", &self.name)
      .field("size", &self.size)
      .field("open", &self.sender.lock().is_some())
      .finish()
  }
}

impl ThreadPool for WorkerPool {
  fn execute(&self, task: Task) -> Result<(), ConnError> {
    let sender = self.sender.lock().clone();
    match sender {
      Some(tx) => tx
        .send(task)
        .map_err(|_| ConnError::DispatchRejected(format!("worker pool '{}' queue closed", self.name))),
      None => Err(ConnError::DispatchRejected(format!("worker pool '{}' is shut down", self.name))),
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Runs tasks on the runtime's blocking thread pool.
#[cfg(feature = "tokio-pool")]
impl ThreadPool for tokio::runtime::Handle {
  fn execute(&self, task: Task) -> Result<(), ConnError> {
    // The JoinHandle is detached; completion is tracked by the acceptor itself.
    let _detached = self.spawn_blocking(task);
    Ok(())
  }
}
