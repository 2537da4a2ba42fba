//! exponential backoff with jitter for retry loops

use std::cmp;
use std::time::Duration;

use rand::Rng;

/// Cap on the backoff exponent so repeated failures cannot overflow the delay.
pub const MAX_BACKOFF_EXP: u32 = 10;

/// `2^events * delay` plus a uniform jitter in `[0, delay)`.
pub fn exponential_backoff(events: u32, delay: Duration) -> Duration {
    let factor = 1u32 << events.min(MAX_BACKOFF_EXP);
    delay * factor + jitter(delay)
}

/// [`exponential_backoff`] clamped to `max`.
pub fn truncated_exponential_backoff(events: u32, delay: Duration, max: Duration) -> Duration {
    cmp::min(max, exponential_backoff(events, delay))
}

fn jitter(delay: Duration) -> Duration {
    let nanos = delay.as_nanos() as u64;
    if nanos == 0 {
        return Duration::from_nanos(0);
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0, nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        let delay = Duration::from_millis(50);
        for events in 0..6u32 {
            let base = delay * (1 << events);
            for _ in 0..20 {
                let d = exponential_backoff(events, delay);
                assert!(d >= base, "{:?} < {:?}", d, base);
                assert!(d < base + delay, "{:?} >= {:?}", d, base + delay);
            }
        }
    }

    #[test]
    fn test_truncation() {
        let delay = Duration::from_millis(100);
        let max = Duration::from_millis(250);
        assert_eq!(truncated_exponential_backoff(5, delay, max), max);
        assert!(truncated_exponential_backoff(0, delay, max) <= max);
    }

    #[test]
    fn test_exponent_cap() {
        let d = truncated_exponential_backoff(60, Duration::from_millis(1), Duration::from_secs(5));
        assert!(d <= Duration::from_secs(5));
    }
}
