//! Time sources.
//!
//! Debouncing, buffer spans and the rate budget all read time through a
//! `Clock` so they can be driven deterministically in tests.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::cancel::CancellationToken;

pub trait Clock: Send + Sync {
    /// Monotonic time.
    fn now(&self) -> Instant;

    /// Wall-clock time, used only for human-readable captions.
    fn wall(&self) -> DateTime<Local>;

    fn sleep(&self, duration: Duration);

    /// Sleep for up to `duration`, waking early on cancel. Returns `true` if
    /// cancelled.
    fn sleep_or_cancel(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        cancel.wait_timeout(duration)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_wall: DateTime<Local>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_wall: Local::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn wall(&self) -> DateTime<Local> {
        let offset = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::zero());
        self.base_wall + offset
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn sleep_or_cancel(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        self.advance(duration);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.now() - t0, Duration::from_secs(10));

        clock.sleep(Duration::from_millis(500));
        assert_eq!(clock.elapsed(), Duration::from_millis(10_500));
    }

    #[test]
    fn cancelled_sleep_returns_immediately() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        cancel.cancel();
        assert!(SystemClock.sleep_or_cancel(Duration::from_secs(30), &cancel));
        assert!(start.elapsed() < Duration::from_secs(5));

        let clock = ManualClock::new();
        assert!(clock.sleep_or_cancel(Duration::from_secs(3), &cancel));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
