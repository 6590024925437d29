//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Calculate exponential backoff delay with jitter.
///
/// Attempt 0 has no delay; attempt `n` waits `base * 2^(n-1)`, capped at `max`,
/// plus up to `jitter_ratio` of that delay.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration, jitter_ratio: f64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    let jitter_range = (capped_delay as f64 * jitter_ratio.clamp(0.0, 1.0)) as u64;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, BASE, Duration::from_secs(2), 0.1);
        assert!(b1.as_millis() >= 100 && b1.as_millis() < 110);

        let b2 = calculate_backoff(2, BASE, Duration::from_secs(2), 0.1);
        assert!(b2.as_millis() >= 200);

        let max = calculate_backoff(10, BASE, Duration::from_secs(1), 0.1);
        assert!(max.as_millis() >= 1000 && max.as_millis() < 1100);
    }

    #[test]
    fn test_first_attempt_has_no_delay() {
        assert_eq!(calculate_backoff(0, BASE, Duration::from_secs(1), 0.5), Duration::ZERO);
    }

    #[test]
    fn test_no_jitter() {
        assert_eq!(
            calculate_backoff(3, BASE, Duration::from_secs(5), 0.0),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let d = calculate_backoff(200, BASE, Duration::from_secs(5), 0.0);
        assert_eq!(d, Duration::from_secs(5));
    }
}
