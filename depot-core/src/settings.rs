//! Read/write settings passed into every I/O call.
//!
//! Settings are plain values. Absent options deserialize to their documented
//! defaults and unknown options are ignored, so a settings struct is never
//! rejected outright. Backends never mutate the caller's copy; they derive a
//! patched one (see `ObjectStorage::patch_read_settings`).

use crate::throttler::Throttler;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Default buffer size for reads and writes (1 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Which throttler an I/O call should consult.
#[derive(Debug, Clone, Default)]
pub enum ThrottlerSelection {
    /// Whatever the storage instance has installed at the time the settings are patched.
    #[default]
    Default,
    /// Never throttle this call.
    Disabled,
    /// Use this throttler regardless of what the storage has installed.
    Explicit(Arc<Throttler>),
}

impl ThrottlerSelection {
    /// The throttler to feed bytes into, if any.
    pub fn throttler(&self) -> Option<&Arc<Throttler>> {
        match self {
            ThrottlerSelection::Explicit(throttler) => Some(throttler),
            ThrottlerSelection::Default | ThrottlerSelection::Disabled => None,
        }
    }

    /// Resolve `Default` to `installed`, leave explicit choices alone.
    pub fn resolve(&self, installed: Option<Arc<Throttler>>) -> ThrottlerSelection {
        match (self, installed) {
            (ThrottlerSelection::Default, Some(throttler)) => ThrottlerSelection::Explicit(throttler),
            (selection, _) => selection.clone(),
        }
    }

    /// Account `amount` transferred bytes against the selected throttler.
    pub fn throttle(&self, amount: u64) -> Duration {
        self.throttler()
            .map(|throttler| throttler.add(amount))
            .unwrap_or(Duration::ZERO)
    }
}

/// How remote reads are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFsMethod {
    /// Synchronous reads on the calling thread.
    Read,
    /// Reads may be served asynchronously and prefetched.
    #[default]
    Threadpool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadSettings {
    pub buffer_size: usize,
    pub remote_fs_method: RemoteFsMethod,
    pub remote_fs_prefetch: bool,
    pub enable_filesystem_cache: bool,
    pub read_from_filesystem_cache_if_exists_otherwise_bypass_cache: bool,
    /// Forward seeks shorter than this are served by reading and discarding.
    pub remote_read_min_bytes_for_seek: usize,
    #[serde(skip)]
    pub throttler: ThrottlerSelection,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            remote_fs_method: RemoteFsMethod::default(),
            remote_fs_prefetch: false,
            enable_filesystem_cache: true,
            read_from_filesystem_cache_if_exists_otherwise_bypass_cache: false,
            remote_read_min_bytes_for_seek: 4 * 1024 * 1024,
            throttler: ThrottlerSelection::Default,
        }
    }
}

impl ReadSettings {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_throttler(mut self, throttler: ThrottlerSelection) -> Self {
        self.throttler = throttler;
        self
    }

    /// Buffer size never below one byte, whatever the caller passed.
    pub fn effective_buffer_size(&self) -> usize {
        self.buffer_size.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteSettings {
    pub buffer_size: usize,
    pub enable_filesystem_cache_on_write_operations: bool,
    /// Size of each part of a multi-part upload.
    pub min_upload_part_size: usize,
    /// Objects up to this size are uploaded with a single request.
    pub max_single_part_upload_size: usize,
    /// How long to wait for a writer pool slot; `None` blocks until one frees up.
    pub pool_wait_timeout_ms: Option<u64>,
    #[serde(skip)]
    pub throttler: ThrottlerSelection,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            enable_filesystem_cache_on_write_operations: false,
            min_upload_part_size: 16 * 1024 * 1024,
            max_single_part_upload_size: 32 * 1024 * 1024,
            pool_wait_timeout_ms: None,
            throttler: ThrottlerSelection::Default,
        }
    }
}

impl WriteSettings {
    pub fn with_throttler(mut self, throttler: ThrottlerSelection) -> Self {
        self.throttler = throttler;
        self
    }

    pub fn pool_wait_timeout(&self) -> Option<Duration> {
        self.pool_wait_timeout_ms.map(Duration::from_millis)
    }
}
