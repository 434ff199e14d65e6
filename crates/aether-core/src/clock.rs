// Injected time and identifier capabilities
//
// The kernel never reads the wall clock or a global counter directly; it goes
// through Clock and PidAllocator so tests can freeze time and predict PIDs.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::types::Pid;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock starting at the given instant
    pub fn starting_at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: std::sync::Mutex::new(now),
        })
    }

    /// Advance the clock
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock poisoned")
    }
}

/// Monotonic PID source
///
/// PIDs are positive, strictly increasing, and never reused for the lifetime
/// of the kernel, regardless of how many processes exit in between.
#[derive(Debug)]
pub struct PidAllocator {
    next: AtomicI64,
}

impl PidAllocator {
    /// Start allocating at 1
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Allocate the next PID
    pub fn allocate(&self) -> Pid {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_strictly_increasing() {
        let alloc = PidAllocator::new();
        let mut last = 0;
        for _ in 0..100 {
            let pid = alloc.allocate();
            assert!(pid > last);
            last = pid;
        }
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::starting_at(Utc::now());
        let before = clock.now();
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now() - before, Duration::seconds(30));
    }
}
