//! Exponential backoff with jitter.
//!
//! Shared by local node retries, rate limiter deferrals and dead letter
//! redelivery.

use std::time::Duration;

use flowline_types::workflow::RetryPolicy;

/// Un-jittered delay for a 0-based retry index: `base * 2^index`, capped.
pub fn backoff_ceiling(retry_index: u32, base_ms: u64, max_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(retry_index.min(63)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

/// Jittered delay: 0.8x to 1.2x of the ceiling, never above `max_ms`.
pub fn backoff_delay(retry_index: u32, base_ms: u64, max_ms: u64) -> Duration {
    let ms = backoff_ceiling(retry_index, base_ms, max_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis(((ms as f64 * jitter) as u64).min(max_ms))
}

/// `delay` stretched by a random 0% to 20%. Used for deferral polling.
pub fn spread(delay: Duration) -> Duration {
    delay.mul_f64(1.0 + rand::random::<f64>() * 0.2)
}

/// Delay before retry number `retry_index` of a node under `policy`.
pub fn node_retry_delay(policy: &RetryPolicy, retry_index: u32) -> Duration {
    backoff_delay(retry_index, policy.base_delay_ms, policy.max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_then_caps() {
        assert_eq!(backoff_ceiling(0, 200, 30_000), 200);
        assert_eq!(backoff_ceiling(1, 200, 30_000), 400);
        assert_eq!(backoff_ceiling(3, 200, 30_000), 1_600);
        assert_eq!(backoff_ceiling(10, 200, 30_000), 30_000);
        assert_eq!(backoff_ceiling(200, 200, 30_000), 30_000);
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..200 {
            let d = backoff_delay(2, 100, 10_000).as_millis() as u64;
            assert!((320..=480).contains(&d), "delay {d} out of band");
        }
    }

    #[test]
    fn spread_only_lengthens() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let d = spread(base);
            assert!(d >= base && d <= Duration::from_millis(120));
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        for _ in 0..200 {
            assert!(backoff_delay(20, 100, 1_000) <= Duration::from_millis(1_000));
        }
    }
}
