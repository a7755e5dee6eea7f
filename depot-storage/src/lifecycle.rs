//! Startup and shutdown state shared by the storage backends.

use depot_core::{ObjectStorageError, StorageResult};
use std::sync::atomic::{AtomicBool, Ordering};

/// Startup/shutdown state of a backend.
///
/// Backends are usable right after construction; `shutdown` only stops new
/// operations from starting and never interrupts running ones.
#[derive(Debug, Default)]
pub struct Lifecycle {
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.shut_down.store(false, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
    }

    /// Returns `true` for the call that actually performed the shutdown.
    pub fn shutdown(&self) -> bool {
        !self.shut_down.swap(true, Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn ensure_running(&self, storage: &str) -> StorageResult<()> {
        if self.is_shut_down() {
            return Err(ObjectStorageError::Shutdown(storage.to_string()));
        }
        Ok(())
    }
}
