use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use crate::config::WatchdogConfig;

/// Progress at or above this is "finalizing" and never counts as a stall
pub const FINALIZING_PERCENT: f64 = 99.0;

/// Flags a transfer that has started, has not finished, and has not moved for too long.
///
/// A freeze at exactly 0% or at 99% and above is not reported. Those sessions are
/// bounded by the [`TimeoutGuard`] instead.
#[derive(Debug, Clone, Copy)]
pub struct StallDetector {
    check_interval: Duration,
    threshold: Duration,
}

impl StallDetector {
    pub fn new(check_interval: Duration, threshold: Duration) -> Self {
        Self {
            check_interval,
            threshold,
        }
    }

    pub fn is_stalled(&self, now: Instant, last_progress_at: Instant, percent: f64) -> bool {
        let elapsed = now.saturating_duration_since(last_progress_at);
        elapsed > self.threshold && percent > 0.0 && percent < FINALIZING_PERCENT
    }

    /// Ticker for one attempt. The first tick fires one interval after `start`.
    pub fn ticker(&self, start: Instant) -> Interval {
        let mut interval = tokio::time::interval_at(start + self.check_interval, self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }
}

/// Absolute ceiling on a session, measured from its start regardless of progress
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    deadline: Instant,
    limit: Duration,
}

impl TimeoutGuard {
    pub fn start(now: Instant, limit: Duration) -> Self {
        Self {
            deadline: now + limit,
            limit,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Completes at the deadline
    pub fn expired(&self) -> Sleep {
        tokio::time::sleep_until(self.deadline)
    }
}

/// Automatic retries are only ever triggered by stalls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether another attempt may follow `attempt` (1-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl From<&WatchdogConfig> for StallDetector {
    fn from(config: &WatchdogConfig) -> Self {
        Self::new(config.stall_check_interval, config.stall_threshold)
    }
}

impl From<&WatchdogConfig> for RetryPolicy {
    fn from(config: &WatchdogConfig) -> Self {
        Self::new(config.max_attempts, config.retry_delay)
    }
}
