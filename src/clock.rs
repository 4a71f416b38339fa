//! Time sources for the recording engine.
//!
//! Durations are always derived from a monotonic reading so that wall-clock
//! adjustments mid-session can never make a recording appear shorter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Monotonic and wall-clock time, injectable for deterministic tests.
pub trait Clock: Send + Sync {
    /// Wall-clock instant in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic time elapsed since the clock was created.
    fn monotonic(&self) -> Duration;
}

/// Production clock. The monotonic reading uses the tokio clock so paused-time
/// tests observe virtual time; outside tests it is the OS monotonic clock.
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually advanced clock for unit tests.
pub struct ManualClock {
    wall: DateTime<Utc>,
    elapsed_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(wall: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            wall,
            elapsed_ms: AtomicU64::new(0),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.wall
            + chrono::Duration::milliseconds(self.elapsed_ms.load(Ordering::SeqCst) as i64)
    }

    fn monotonic(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }
}
