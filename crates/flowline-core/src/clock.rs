//! Wall-clock source for persisted timestamps.
//!
//! Every persisted suspension (`opens_at`, `next_retry_at`, `window_closes_at`)
//! is compared against [`Clock::now`]. The clock is anchored to
//! `tokio::time::Instant`, so paused-time tests that call
//! `tokio::time::advance` move persisted deadlines and in-process sleeps
//! together.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall_anchor: DateTime<Utc>,
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Clock whose `now()` is `start` at construction time.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            wall_anchor: start,
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        self.wall_anchor + TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::zero())
    }

    /// Time remaining until `deadline`, zero if it already passed.
    pub fn until(&self, deadline: DateTime<Utc>) -> Duration {
        (deadline - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// `chrono` delta from a millisecond count, saturating on overflow.
pub fn millis(ms: u64) -> TimeDelta {
    TimeDelta::try_milliseconds(i64::try_from(ms).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

/// `chrono` delta from a second count, saturating on overflow.
pub fn seconds(secs: u64) -> TimeDelta {
    TimeDelta::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clock_follows_paused_tokio_time() {
        let start = Utc::now();
        let clock = Clock::starting_at(start);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now() - start, TimeDelta::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn until_saturates_at_zero() {
        let clock = Clock::new();
        let deadline = clock.now() + TimeDelta::seconds(5);
        assert_eq!(clock.until(deadline), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(clock.until(deadline), Duration::ZERO);
    }

    #[test]
    fn conversions_saturate() {
        assert_eq!(millis(1_500), TimeDelta::milliseconds(1_500));
        assert_eq!(seconds(u64::MAX), TimeDelta::MAX);
    }
}
