//! Time source for the system's transaction steps.

use crate::domain::TimeMs;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Supplies the timestamp of each step. Read once per operation.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> TimeMs;
}

/// Wall-clock time in UTC milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeMs {
        TimeMs::new(chrono::Utc::now().timestamp_millis())
    }
}

/// Clock moved by hand, for tests and scripted sessions.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start: TimeMs) -> Self {
        Self {
            now_ms: AtomicI64::new(start.as_ms()),
        }
    }

    pub fn set(&self, now: TimeMs) {
        self.now_ms.store(now.as_ms(), Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeMs {
        TimeMs::new(self.now_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(TimeMs::new(1_000));
        assert_eq!(clock.now(), TimeMs::new(1_000));
        clock.advance(500);
        assert_eq!(clock.now(), TimeMs::new(1_500));
        clock.set(TimeMs::new(10));
        assert_eq!(clock.now(), TimeMs::new(10));
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now().as_ms() > 1_577_836_800_000);
    }
}
