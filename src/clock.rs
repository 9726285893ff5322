//! Millisecond Clock Sources
//!
//! Time enters the engine through an injected [`Clock`] so that sessions,
//! queues and schedulers can run against real time in production and a
//! hand-advanced clock in tests. No engine component reads ambient time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic millisecond clock.
///
/// Values are relative to an arbitrary origin; only differences are
/// meaningful. Implementations must be monotonically non-decreasing.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the clock's origin.
    fn now_ms(&self) -> i64;
}

/// Wall-clock backed [`Clock`] using a monotonic [`Instant`] origin.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock with its origin at construction time.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

/// Hand-advanced [`Clock`] for deterministic tests.
///
/// Cloning shares the underlying time, so a test can hold one handle while
/// the component under test holds another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock at a given time.
    pub fn at(now_ms: i64) -> Self {
        let clock = Self::new();
        clock.set(now_ms);
        clock
    }

    /// Advance the clock by `dt_ms` milliseconds.
    pub fn advance(&self, dt_ms: i64) {
        self.now.fetch_add(dt_ms, Ordering::SeqCst);
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
