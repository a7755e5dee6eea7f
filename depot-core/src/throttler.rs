//! Bandwidth throttling shared by every I/O call of a storage instance.
//!
//! A [`Throttler`] bounds the aggregate bytes/sec of whoever holds a reference to
//! it. [`RemoteThrottlers`] is the read/write pair an object storage owns; backends
//! take a snapshot of it before each I/O and feed every transferred chunk through
//! [`Throttler::add`].

use crate::config::StorageContext;
use metrics::counter;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Accounting window after which the running average is restarted.
const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ThrottlerState {
    window_start: Instant,
    bytes_in_window: u64,
}

/// Rate limiter bounding the average throughput of its callers.
#[derive(Debug)]
pub struct Throttler {
    max_speed: u64,
    window: Duration,
    state: Mutex<ThrottlerState>,
}

impl Throttler {
    /// `max_speed` is in bytes per second; zero disables limiting.
    pub fn new(max_speed: u64) -> Self {
        Self::with_window(max_speed, DEFAULT_WINDOW)
    }

    pub fn with_window(max_speed: u64, window: Duration) -> Self {
        Self {
            max_speed,
            window,
            state: Mutex::new(ThrottlerState {
                window_start: Instant::now(),
                bytes_in_window: 0,
            }),
        }
    }

    pub fn max_speed(&self) -> u64 {
        self.max_speed
    }

    /// Account `amount` bytes and block the caller long enough to keep the
    /// average speed at or below `max_speed`. Returns the time slept.
    pub fn add(&self, amount: u64) -> Duration {
        if self.max_speed == 0 || amount == 0 {
            return Duration::ZERO;
        }

        let sleep_for = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let elapsed = now.duration_since(state.window_start);
            // Restart the window only once the budget for it has been honoured.
            let budget_spent =
                Duration::from_secs_f64(state.bytes_in_window as f64 / self.max_speed as f64);
            if elapsed >= self.window && elapsed >= budget_spent {
                state.window_start = now;
                state.bytes_in_window = 0;
            }
            state.bytes_in_window = state.bytes_in_window.saturating_add(amount);

            let desired =
                Duration::from_secs_f64(state.bytes_in_window as f64 / self.max_speed as f64);
            desired.saturating_sub(now.duration_since(state.window_start))
        };

        if !sleep_for.is_zero() {
            counter!("depot_throttler_sleep_microseconds").increment(sleep_for.as_micros() as u64);
            thread::sleep(sleep_for);
        }
        sleep_for
    }
}

/// Throttler references installed at one point in time.
#[derive(Debug, Clone, Default)]
pub struct ThrottlerPair {
    pub read: Option<Arc<Throttler>>,
    pub write: Option<Arc<Throttler>>,
}

/// The read/write throttler slots of one object storage instance.
///
/// Both slots are replaced under a single lock, so a snapshot always observes a
/// pair installed together. The lock is only held to copy or swap the two `Arc`s.
#[derive(Debug, Default)]
pub struct RemoteThrottlers {
    pair: Mutex<ThrottlerPair>,
}

impl RemoteThrottlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install throttlers for the bandwidth limits carried by `context`.
    ///
    /// Must be called from every backend's `apply_new_settings`.
    pub fn apply_remote_throttling_settings(&self, context: &StorageContext) {
        let read = make_throttler(context.max_remote_read_network_bandwidth);
        let write = make_throttler(context.max_remote_write_network_bandwidth);
        self.install(ThrottlerPair { read, write });
        tracing::debug!(
            read_bandwidth = context.max_remote_read_network_bandwidth,
            write_bandwidth = context.max_remote_write_network_bandwidth,
            "installed remote throttlers"
        );
    }

    pub fn install(&self, pair: ThrottlerPair) {
        *self.pair.lock().unwrap_or_else(PoisonError::into_inner) = pair;
    }

    pub fn snapshot(&self) -> ThrottlerPair {
        self.pair.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn read(&self) -> Option<Arc<Throttler>> {
        self.snapshot().read
    }

    pub fn write(&self) -> Option<Arc<Throttler>> {
        self.snapshot().write
    }
}

fn make_throttler(max_speed: u64) -> Option<Arc<Throttler>> {
    (max_speed > 0).then(|| Arc::new(Throttler::new(max_speed)))
}
