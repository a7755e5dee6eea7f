//! Bounded thread pool for asynchronous multi-part uploads.
//!
//! One pool is built from configuration at startup and handed to every backend
//! that needs it. Submitting into a full pool blocks the caller until a slot frees
//! up, or fails with `PoolExhausted` once an explicit timeout elapses.

use crate::error::{ObjectStorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterPoolConfig {
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Tasks allowed to wait for a worker before submitters start blocking.
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
}

fn default_max_threads() -> usize {
    100
}

fn default_max_queued() -> usize {
    1000
}

impl Default for WriterPoolConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            max_queued: default_max_queued(),
        }
    }
}

#[derive(Debug, Default)]
struct Slots {
    in_flight: Mutex<usize>,
    freed: Condvar,
}

impl Slots {
    fn release(&self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *in_flight = in_flight.saturating_sub(1);
        self.freed.notify_one();
    }
}

/// Returns its slot when the task finishes, including by panicking.
struct SlotPermit(Arc<Slots>);

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.0.release();
    }
}

pub struct WriterPool {
    pool: rayon::ThreadPool,
    slots: Arc<Slots>,
    capacity: usize,
}

impl WriterPool {
    pub fn new(config: WriterPoolConfig) -> StorageResult<Self> {
        let threads = config.max_threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("depot-writer-{i}"))
            .panic_handler(|_| tracing::error!("writer pool task panicked"))
            .build()
            .map_err(|e| ObjectStorageError::Configuration(e.to_string()))?;
        Ok(Self {
            pool,
            slots: Arc::new(Slots::default()),
            capacity: threads + config.max_queued,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        *self.slots.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `task` on the pool, blocking while the pool is full.
    pub fn schedule<T, F>(&self, task: F, timeout: Option<Duration>) -> StorageResult<TaskHandle<T>>
    where
        F: FnOnce() -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.acquire(timeout)?;
        let permit = SlotPermit(Arc::clone(&self.slots));
        let (tx, rx) = mpsc::sync_channel(1);
        self.pool.spawn(move || {
            let result = task();
            // Free the slot before the waiter can observe the result.
            drop(permit);
            // The handle may have been dropped; the result is then discarded.
            let _ = tx.send(result);
        });
        Ok(TaskHandle { rx })
    }

    fn acquire(&self, timeout: Option<Duration>) -> StorageResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut in_flight = self.slots.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_flight >= self.capacity {
            in_flight = match deadline {
                None => self
                    .slots
                    .freed
                    .wait(in_flight)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ObjectStorageError::PoolExhausted(format!(
                            "no free slot among {} after {:?}",
                            self.capacity,
                            timeout.unwrap_or_default()
                        )));
                    }
                    self.slots
                        .freed
                        .wait_timeout(in_flight, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        *in_flight += 1;
        Ok(())
    }
}

impl std::fmt::Debug for WriterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterPool")
            .field("threads", &self.pool.current_num_threads())
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Result of a task submitted to a [`WriterPool`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<StorageResult<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes and return its result.
    pub fn wait(self) -> StorageResult<T> {
        self.rx.recv().map_err(|_| {
            ObjectStorageError::Transport("writer pool task terminated without a result".into())
        })?
    }
}
