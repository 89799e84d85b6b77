//! Reconnect backoff.

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;

/// Jitter factor drawn per attempt.
const JITTER: RangeInclusive<f64> = 0.4..=0.7;

/// Delay before reconnect attempt `attempt` (zero-based):
/// `min(base + attempt² × U(0.4, 0.7) seconds, max)`.
pub(crate) fn reconnect_delay<R: Rng + ?Sized>(
    attempt: u32,
    base: Duration,
    max: Duration,
    rng: &mut R,
) -> Duration {
    let n = f64::from(attempt);
    let secs = base.as_secs_f64() + n * n * rng.random_range(JITTER);
    if secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(20);

    #[test]
    fn first_attempt_uses_base() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(reconnect_delay(0, BASE, MAX, &mut rng), BASE);
    }

    #[test]
    fn large_attempts_are_capped() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(reconnect_delay(1_000, BASE, MAX, &mut rng), MAX);
        assert_eq!(reconnect_delay(u32::MAX, BASE, MAX, &mut rng), MAX);
    }

    #[test]
    fn mean_delay_grows_with_attempt() {
        let mut rng = StdRng::seed_from_u64(42);
        let mean = |attempt: u32, rng: &mut StdRng| {
            let total: f64 = (0..200)
                .map(|_| reconnect_delay(attempt, BASE, MAX, rng).as_secs_f64())
                .sum();
            total / 200.0
        };
        let mut previous = 0.0;
        for attempt in 0..8 {
            let m = mean(attempt, &mut rng);
            assert!(m >= previous, "attempt {attempt}: {m} < {previous}");
            previous = m;
        }
    }

    proptest! {
        #[test]
        fn delay_is_bounded(attempt in 0u32..10_000, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = reconnect_delay(attempt, BASE, MAX, &mut rng);
            prop_assert!(delay >= BASE);
            prop_assert!(delay <= MAX);
        }

        #[test]
        fn delay_within_jitter_envelope(attempt in 0u32..6, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let secs = reconnect_delay(attempt, BASE, MAX, &mut rng).as_secs_f64();
            let n2 = f64::from(attempt * attempt);
            prop_assert!(secs >= 0.1 + n2 * 0.4 - 1e-9);
            prop_assert!(secs <= 0.1 + n2 * 0.7 + 1e-9);
        }
    }
}
