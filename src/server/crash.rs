//! Crash-restart accounting
//!
//! A Program's `CrashCounter` is reset only by a graceful exit; a manual
//! `Start()` or `Edit`/`Reload` does not clear it. Once it reaches
//! `CrashLimit` auto-restart stays suppressed until a graceful exit occurs.

use std::sync::atomic::{AtomicU32, Ordering};

/// Default ceiling before auto-restart-on-crash is suppressed.
pub const DEFAULT_CRASH_LIMIT: u32 = 3;

#[derive(Debug)]
pub struct CrashCounter {
    count: AtomicU32,
    limit: u32,
}

impl CrashCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            limit,
        }
    }

    pub fn with_count(limit: u32, count: u32) -> Self {
        Self {
            count: AtomicU32::new(count),
            limit,
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Reset to 0. Only called after a graceful exit.
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    /// Attempt to record a crash. Increments and returns `true` iff the
    /// counter was below the limit; otherwise leaves it untouched and
    /// returns `false` (ceiling tripped).
    pub fn record_crash(&self) -> bool {
        loop {
            let current = self.count.load(Ordering::SeqCst);
            if current >= self.limit {
                return false;
            }
            if self
                .count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn at_limit(&self) -> bool {
        self.count() >= self.limit
    }
}

impl Default for CrashCounter {
    fn default() -> Self {
        Self::new(DEFAULT_CRASH_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_restart_ceiling() {
        let counter = CrashCounter::new(2);
        assert!(counter.record_crash());
        assert_eq!(counter.count(), 1);
        assert!(counter.record_crash());
        assert_eq!(counter.count(), 2);
        // Third crash exceeds the limit: not recorded further, restart suppressed.
        assert!(!counter.record_crash());
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn manual_start_does_not_reset() {
        let counter = CrashCounter::new(2);
        counter.record_crash();
        counter.record_crash();
        assert!(counter.at_limit());
        // A manual Start()/Edit() never calls reset(); only graceful exit does.
        assert!(counter.at_limit());
        counter.reset();
        assert!(!counter.at_limit());
        assert_eq!(counter.count(), 0);
    }
}
