use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_PER_MINUTE: u32 = 19;
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(3);

const WINDOW: Duration = Duration::from_secs(60);

/// Why a delivery attempt was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Throttle {
    /// `max_per_minute` deliveries already happened in the last 60 s.
    MinuteCap { sent: u32, retry_after: Duration },
    /// The previous delivery was less than `min_interval` ago.
    TooSoon { retry_after: Duration },
}

impl fmt::Display for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Throttle::MinuteCap { sent, retry_after } => write!(
                f,
                "{} deliveries in the last minute (retry in {:.1}s)",
                sent,
                retry_after.as_secs_f32()
            ),
            Throttle::TooSoon { retry_after } => {
                write!(f, "too soon after last delivery (retry in {:.1}s)", retry_after.as_secs_f32())
            }
        }
    }
}

/// Process-wide delivery allowance.
///
/// Keeps the instant of every delivery in the trailing 60 s, so the cap holds
/// over any rolling minute rather than per calendar minute.
#[derive(Debug)]
pub struct RateBudget {
    max_per_minute: u32,
    min_interval: Duration,
    sent: VecDeque<Instant>,
    last_sent_at: Option<Instant>,
}

impl RateBudget {
    pub fn new(max_per_minute: u32, min_interval: Duration) -> Self {
        Self {
            max_per_minute,
            min_interval,
            sent: VecDeque::with_capacity(max_per_minute as usize),
            last_sent_at: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.sent.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether one more delivery is allowed at `now`.
    pub fn check(&mut self, now: Instant) -> Result<(), Throttle> {
        self.prune(now);

        if self.sent.len() as u32 >= self.max_per_minute {
            let retry_after = self
                .sent
                .front()
                .map(|oldest| WINDOW.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(WINDOW);
            return Err(Throttle::MinuteCap {
                sent: self.sent.len() as u32,
                retry_after,
            });
        }

        if let Some(last) = self.last_sent_at {
            let since = now.saturating_duration_since(last);
            if since < self.min_interval {
                return Err(Throttle::TooSoon {
                    retry_after: self.min_interval - since,
                });
            }
        }
        Ok(())
    }

    /// Consume one unit of budget.
    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.sent.push_back(now);
        self.last_sent_at = Some(now);
    }

    /// How long to wait before the next delivery inside a fan-out. `None`
    /// when the minute cap is reached, since spacing alone cannot help.
    pub fn wait_needed(&mut self, now: Instant) -> Option<Duration> {
        match self.check(now) {
            Ok(()) => Some(Duration::ZERO),
            Err(Throttle::TooSoon { retry_after }) => Some(retry_after),
            Err(Throttle::MinuteCap { .. }) => None,
        }
    }

    pub fn sent_in_window(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.sent.len() as u32
    }

    /// Oldest delivery still inside the rolling window.
    pub fn window_start(&self) -> Option<Instant> {
        self.sent.front().copied()
    }

    pub fn last_sent_at(&self) -> Option<Instant> {
        self.last_sent_at
    }

    pub fn max_per_minute(&self) -> u32 {
        self.max_per_minute
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

impl Default for RateBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_MINUTE, DEFAULT_MIN_INTERVAL)
    }
}
