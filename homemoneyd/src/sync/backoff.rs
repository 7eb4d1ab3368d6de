use rand::Rng;
use std::time::Duration;

pub const SYNC_RETRY_BASE: Duration = Duration::from_secs(30);
pub const SYNC_RETRY_MAX: Duration = Duration::from_secs(30 * 60);

/// Exponential delay between failed sync runs.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn for_sync_runs() -> Self {
        Self::new(SYNC_RETRY_BASE, SYNC_RETRY_MAX, true)
    }

    /// Delay before the next attempt after `failures` consecutive failed
    /// runs. The first failure waits about `base`.
    pub fn after_failures(&self, failures: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.after_failures_with_rng(failures, &mut rng)
    }

    pub fn after_failures_with_rng<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = failures.saturating_sub(1).min(16);
        let capped = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            // upper half of the step
            rng.gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn sync_retries_double_until_capped() {
        let backoff = Backoff::new(SYNC_RETRY_BASE, SYNC_RETRY_MAX, false);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (1..=8)
            .map(|n| backoff.after_failures_with_rng(n, &mut rng).as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 480, 960, 1800, 1800]);
    }

    #[test]
    fn jitter_stays_within_half_step_and_cap() {
        let backoff = Backoff::for_sync_runs();
        let mut rng = StdRng::seed_from_u64(42);
        for failures in 1..20 {
            let delay = backoff.after_failures_with_rng(failures, &mut rng);
            assert!(delay <= SYNC_RETRY_MAX);
            assert!(delay >= SYNC_RETRY_BASE / 2);
        }
    }

    #[test]
    fn zero_failures_behaves_like_first() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), false);
        assert_eq!(backoff.after_failures(0), Duration::from_millis(100));
        assert_eq!(backoff.after_failures(1), Duration::from_millis(100));
    }
}
